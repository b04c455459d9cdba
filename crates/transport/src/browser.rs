//! Browser-driven transport: the prompt interaction state machine.
//!
//! acquire -> ensure_ready -> baseline -> send -> wait -> extract. Each step
//! either advances or ends the interaction with a classified error and the
//! stage it failed in.

use async_trait::async_trait;
use chatcell_core::{
    make_snippet, AssistantConfig, ErrorCode, ErrorRecord, Evidence, InteractionRequest,
    ResponseMetadata, SendOutcome, Warning, WarningCode,
};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::completion::CompletionDetector;
use crate::extract::html_to_markdown;
use crate::page::{AcquireError, PageError, PageOps, PageSource};
use crate::readiness::{assess, Readiness, STAGE_ENSURE_READY, STAGE_SEND};
use crate::transport::{ChatManager, Transport};

pub const STAGE_ACQUIRE: &str = "acquire";
pub const STAGE_WAIT: &str = "wait";
pub const STAGE_EXTRACT: &str = "extract";

/// Page re-checked for auth walls and rate limits every this many polls.
const REASSESS_EVERY: u32 = 5;
/// Upper bound on a single wait; larger timeouts are clamped to it.
const MAX_WAIT: Duration = Duration::from_secs(30 * 24 * 3600);

pub struct BrowserTransport {
    pub(crate) assistant_id: String,
    pub(crate) config: AssistantConfig,
    pub(crate) pages: Arc<dyn PageSource>,
    pub(crate) chat_id_re: Option<Regex>,
}

enum WaitEnd {
    Complete,
    Deadline,
    Blocked(ErrorRecord),
}

impl BrowserTransport {
    pub fn new(assistant_id: impl Into<String>, config: AssistantConfig, pages: Arc<dyn PageSource>) -> Self {
        let assistant_id = assistant_id.into();
        let chat_id_re = config.chat_id_pattern.as_deref().and_then(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(assistant = %assistant_id, error = %e, "Ignoring invalid chat id pattern");
                None
            }
        });
        Self {
            assistant_id,
            config,
            pages,
            chat_id_re,
        }
    }

    pub fn assistant_id(&self) -> &str {
        &self.assistant_id
    }

    pub(crate) async fn acquire(&self) -> Result<Arc<dyn PageOps>, ErrorRecord> {
        self.pages
            .acquire(&self.config.base_url)
            .await
            .map_err(|e| match e {
                AcquireError::Connection(msg) => ErrorRecord::new(ErrorCode::CdpDisconnected, msg),
                AcquireError::Page(msg) => ErrorRecord::new(ErrorCode::SelectorMissing, msg)
                    .with_evidence(Evidence {
                        page_url: Some(self.config.base_url.clone()),
                        ..Default::default()
                    }),
            })
    }

    /// Classify a page-operation failure. Connection-level failures always
    /// win over whatever selector was being used.
    pub(crate) fn page_error(&self, err: PageError, selector: Option<&str>, page_url: Option<String>) -> ErrorRecord {
        if err.is_disconnect() {
            return ErrorRecord::new(ErrorCode::CdpDisconnected, err.to_string())
                .with_evidence(Evidence::default().with_page_url(page_url));
        }
        let evidence = match selector {
            Some(sel) => Evidence::selector(sel),
            None => Evidence::default(),
        };
        ErrorRecord::new(ErrorCode::SelectorMissing, err.to_string())
            .with_evidence(evidence.with_page_url(page_url))
    }

    fn fail(mut meta: ResponseMetadata, error: ErrorRecord, stage: &str) -> SendOutcome {
        let error = error.at_stage(stage, &meta.stage_log);
        meta.stage_log = error.stage_log.clone();
        debug!(
            request_id = %meta.request_id,
            code = %error.code,
            stage = stage,
            "Interaction failed"
        );
        SendOutcome::failure(meta, error)
    }

    async fn wait_for_completion(
        &self,
        page: &dyn PageOps,
        baseline: usize,
        deadline: Instant,
    ) -> Result<(WaitEnd, usize), PageError> {
        let selectors = &self.config.selectors;
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(50));
        let mut detector =
            CompletionDetector::new(baseline, Duration::from_millis(self.config.stability_ms));
        let mut count = baseline;
        let mut polls: u32 = 0;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                if let Some(err) = self.blocking_state(page, poll).await {
                    return Ok((WaitEnd::Blocked(err), count));
                }
                return Ok((WaitEnd::Deadline, count));
            }

            polls = polls.wrapping_add(1);
            if polls % REASSESS_EVERY == 0 {
                if let Some(err) = self.blocking_state(page, poll).await {
                    return Ok((WaitEnd::Blocked(err), count));
                }
            }

            match tokio::time::timeout(remaining, page.response_stats(selectors)).await {
                Ok(Ok(stats)) => {
                    count = stats.count;
                    if detector.observe(stats, Instant::now()) {
                        return Ok((WaitEnd::Complete, count));
                    }
                }
                Ok(Err(e)) if e.is_disconnect() => return Err(e),
                Ok(Err(e)) => debug!(error = %e, "Response poll failed, retrying"),
                Err(_) => continue,
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(poll.min(remaining)).await;
        }
    }

    /// Auth walls and rate-limit banners that appeared after submit. An
    /// unusable input is expected while the reply is generating and is not
    /// reported.
    async fn blocking_state(&self, page: &dyn PageOps, limit: Duration) -> Option<ErrorRecord> {
        let selectors = &self.config.selectors;
        let probe = match tokio::time::timeout(limit, page.probe(selectors)).await {
            Ok(Ok(p)) => p,
            Ok(Err(e)) => {
                debug!(error = %e, "Page re-check failed");
                return None;
            }
            Err(_) => return None,
        };
        match assess(&probe, selectors) {
            Readiness::Blocked { error, .. }
                if matches!(error.code, ErrorCode::AuthRequired | ErrorCode::RateLimited) =>
            {
                Some(error)
            }
            _ => None,
        }
    }
}

#[async_trait]
impl Transport for BrowserTransport {
    fn kind(&self) -> &'static str {
        "browser"
    }

    async fn send_prompt(&self, request: &InteractionRequest) -> SendOutcome {
        let selectors = &self.config.selectors;
        let mut meta = ResponseMetadata::for_request(request);

        let page = match self.acquire().await {
            Ok(p) => p,
            Err(e) => return Self::fail(meta, e, STAGE_ACQUIRE),
        };

        let probe = match page.probe(selectors).await {
            Ok(p) => p,
            Err(e) => {
                let err = self.page_error(e, Some(&selectors.input), None);
                return Self::fail(meta, err, STAGE_ENSURE_READY);
            }
        };
        meta.page_url = Some(probe.url.clone()).filter(|u| !u.is_empty());
        match assess(&probe, selectors) {
            Readiness::Ready { warnings } => meta.warnings.extend(warnings),
            Readiness::Blocked { error, stage } => return Self::fail(meta, error, stage),
        }

        let baseline = match page.response_stats(selectors).await {
            Ok(s) => s.count,
            Err(e) => {
                let err = self.page_error(e, Some(&selectors.response_block), meta.page_url.clone());
                return Self::fail(meta, err, STAGE_SEND);
            }
        };

        meta.stage_log.mark("send_start");
        let delay = Duration::from_millis(self.config.type_delay_ms);
        if let Err(e) = page.type_text(&selectors.input, &request.prompt, delay).await {
            let err = self.page_error(e, Some(&selectors.input), meta.page_url.clone());
            return Self::fail(meta, err, STAGE_SEND);
        }
        if let Err(e) = page.submit(selectors).await {
            let sel = selectors.send_button.as_deref().unwrap_or(&selectors.input);
            let err = self.page_error(e, Some(sel), meta.page_url.clone());
            return Self::fail(meta, err, STAGE_SEND);
        }
        meta.stage_log.mark("send_complete");
        debug!(request_id = %request.request_id, baseline, "Prompt submitted");

        let observed_model = match selectors.model_name.as_deref() {
            Some(sel) => page.model_name(sel).await.ok().flatten(),
            None => None,
        };

        if !request.wait_for_response {
            return SendOutcome {
                success: true,
                snippet: None,
                markdown: None,
                metadata: meta,
                observed_model,
            };
        }

        meta.waited = true;
        meta.stage_log.mark("wait_start");
        let wait_started = Instant::now();
        let deadline = wait_started + Duration::from_secs(request.timeout_s).min(MAX_WAIT);

        let count = match self.wait_for_completion(page.as_ref(), baseline, deadline).await {
            Ok((WaitEnd::Complete, count)) => {
                meta.elapsed_ms = Some(wait_started.elapsed().as_millis() as u64);
                meta.stage_log.mark("wait_complete");
                count
            }
            Ok((WaitEnd::Deadline, _)) => {
                meta.elapsed_ms = Some(wait_started.elapsed().as_millis() as u64);
                let sel = selectors
                    .generating
                    .clone()
                    .unwrap_or_else(|| selectors.response_block.clone());
                let err = ErrorRecord::new(
                    ErrorCode::ResponseTimeout,
                    format!("No complete response within {}s", request.timeout_s),
                )
                .with_evidence(Evidence::selector(sel).with_page_url(meta.page_url.clone()));
                return Self::fail(meta, err, STAGE_WAIT);
            }
            Ok((WaitEnd::Blocked(err), _)) => {
                meta.elapsed_ms = Some(wait_started.elapsed().as_millis() as u64);
                warn!(request_id = %request.request_id, code = %err.code, "Page blocked while waiting for the reply");
                return Self::fail(meta, err, STAGE_WAIT);
            }
            Err(e) => {
                meta.elapsed_ms = Some(wait_started.elapsed().as_millis() as u64);
                let err = self.page_error(e, None, meta.page_url.clone());
                return Self::fail(meta, err, STAGE_WAIT);
            }
        };

        // Only blocks created by this interaction are eligible.
        let html = if count > baseline {
            match page.response_html(&selectors.response_block, count - 1).await {
                Ok(h) => h,
                Err(e) => {
                    let err = self.page_error(e, Some(&selectors.response_block), meta.page_url.clone());
                    return Self::fail(meta, err, STAGE_EXTRACT);
                }
            }
        } else {
            None
        };
        let markdown = html.as_deref().map(html_to_markdown).unwrap_or_default();
        meta.stage_log.mark("extract_done");

        if markdown.trim().is_empty() {
            meta.warnings.push(
                Warning::new(WarningCode::EmptyResponse, "Response completed but no text was extracted")
                    .with_evidence(
                        Evidence::selector(&selectors.response_block)
                            .with_page_url(meta.page_url.clone()),
                    ),
            );
        }

        SendOutcome {
            success: true,
            snippet: Some(make_snippet(&markdown)),
            markdown: Some(markdown),
            metadata: meta,
            observed_model,
        }
    }

    fn chat_manager(&self) -> Option<&dyn ChatManager> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{Banner, PageProbe, ResponseStats};
    use crate::testing::{FakePage, FakeSource};

    fn transport(page: Arc<FakePage>) -> BrowserTransport {
        let mut cfg = AssistantConfig::claude();
        cfg.type_delay_ms = 0;
        BrowserTransport::new("claude", cfg, Arc::new(FakeSource::with_page(page)))
    }

    fn stats(count: usize, last_size: usize, generating: bool) -> ResponseStats {
        ResponseStats {
            count,
            last_size,
            generating,
        }
    }

    fn stage_order(out: &SendOutcome) -> Vec<String> {
        out.metadata.stage_log.stages().map(str::to_string).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_interaction() {
        let page = FakePage::ready("https://claude.ai/chat/abc");
        page.script_stats(vec![
            stats(1, 40, false),
            stats(1, 40, true),
            stats(2, 5, true),
            stats(2, 30, false),
        ]);
        page.set_blocks(vec!["<p>old</p>", "<p>The answer is <strong>5</strong>.</p>"]);
        page.set_model(Some("Claude Sonnet"));
        let t = transport(page.clone());

        let req = InteractionRequest::new("claude", "What is 2+3?", true, 60);
        let out = t.send_prompt(&req).await;

        assert!(out.success, "{:?}", out.metadata.error);
        assert!(out.text().contains("**5**"));
        assert!(out.snippet.as_deref().unwrap().contains('5'));
        assert_eq!(
            stage_order(&out),
            vec!["send_start", "send_complete", "wait_start", "wait_complete", "extract_done"]
        );
        let log = &out.metadata.stage_log;
        assert!(log.get("send_start").unwrap() <= log.get("extract_done").unwrap());
        assert!(out.metadata.waited);
        assert!(out.metadata.elapsed_ms.unwrap() >= 2000);
        assert_eq!(out.metadata.page_url.as_deref(), Some("https://claude.ai/chat/abc"));
        assert_eq!(out.observed_model.as_deref(), Some("Claude Sonnet"));
        assert_eq!(page.typed(), "What is 2+3?");
        assert_eq!(page.submissions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_banner_fails_at_send() {
        let page = FakePage::ready("https://claude.ai/new");
        page.update_probe(|p| {
            p.banners.push(Banner {
                selector: "[role='alert']".to_string(),
                text: "Too many requests. Please try again later.".to_string(),
            })
        });
        let t = transport(page.clone());

        let out = t.send_prompt(&InteractionRequest::new("claude", "hi", true, 30)).await;
        assert!(!out.success);
        let err = out.metadata.error.as_ref().unwrap();
        assert_eq!(err.code, ErrorCode::RateLimited);
        assert_eq!(err.failure_stage.as_deref(), Some("send"));
        assert_eq!(out.metadata.stage_log.failure_stage(), Some("send"));
        assert_eq!(page.submissions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_wall_fails_at_ensure_ready() {
        let page = FakePage::ready("https://claude.ai/login");
        page.update_probe(|p| {
            p.input_present = false;
            p.auth_indicator = Some("input[type='password']".to_string());
        });
        let out = transport(page).send_prompt(&InteractionRequest::new("claude", "hi", true, 30)).await;
        let err = out.metadata.error.unwrap();
        assert_eq!(err.code, ErrorCode::AuthRequired);
        assert_eq!(err.failure_stage.as_deref(), Some("ensure_ready"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_times_out_immediately() {
        let page = FakePage::ready("https://claude.ai/new");
        page.script_stats(vec![stats(0, 0, false)]);
        page.hold_stats(stats(0, 0, true));
        let out = transport(page)
            .send_prompt(&InteractionRequest::new("claude", "hi", true, 0))
            .await;
        let err = out.metadata.error.as_ref().unwrap();
        assert_eq!(err.code, ErrorCode::ResponseTimeout);
        assert_eq!(err.failure_stage.as_deref(), Some("wait"));
        assert!(out.metadata.elapsed_ms.unwrap() <= 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_completing_reply_times_out_near_deadline() {
        let page = FakePage::ready("https://claude.ai/new");
        page.script_stats(vec![stats(0, 0, false)]);
        page.hold_stats(stats(1, 10, true));
        let out = transport(page)
            .send_prompt(&InteractionRequest::new("claude", "hi", true, 5))
            .await;
        assert_eq!(out.error_code(), Some(ErrorCode::ResponseTimeout));
        let elapsed = out.metadata.elapsed_ms.unwrap();
        assert!((4800..=5200).contains(&elapsed), "elapsed {}", elapsed);
        assert!(out.metadata.stage_log.get("wait_start").is_some());
        assert!(out.metadata.stage_log.get("wait_complete").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_mid_wait() {
        let page = FakePage::ready("https://claude.ai/new");
        page.script_stats(vec![stats(0, 0, false), stats(0, 0, true)]);
        page.fail_stats_after_script(PageError::Disconnected("socket closed".into()));
        let out = transport(page)
            .send_prompt(&InteractionRequest::new("claude", "hi", true, 30))
            .await;
        let err = out.metadata.error.unwrap();
        assert_eq!(err.code, ErrorCode::CdpDisconnected);
        assert_eq!(err.failure_stage.as_deref(), Some("wait"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_reply_is_success_with_warning() {
        let page = FakePage::ready("https://claude.ai/new");
        page.script_stats(vec![stats(0, 0, false)]);
        page.hold_stats(stats(1, 11, false));
        page.set_blocks(vec!["<div> </div>"]);
        let out = transport(page)
            .send_prompt(&InteractionRequest::new("claude", "hi", true, 30))
            .await;
        assert!(out.success);
        assert_eq!(out.text(), "");
        assert_eq!(out.metadata.warnings.len(), 1);
        assert_eq!(out.metadata.warnings[0].code, WarningCode::EmptyResponse);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_wait_returns_after_send() {
        let page = FakePage::ready("https://claude.ai/new");
        page.script_stats(vec![stats(3, 0, false)]);
        let out = transport(page.clone())
            .send_prompt(&InteractionRequest::new("claude", "fire and forget", false, 30))
            .await;
        assert!(out.success);
        assert!(!out.metadata.waited);
        assert!(out.metadata.elapsed_ms.is_none());
        assert!(out.snippet.is_none() && out.markdown.is_none());
        assert_eq!(stage_order(&out), vec!["send_start", "send_complete"]);
        assert_eq!(page.submissions(), 1);
    }

    #[tokio::test]
    async fn test_acquire_failures_are_classified() {
        let t = BrowserTransport::new(
            "claude",
            AssistantConfig::claude(),
            Arc::new(FakeSource::failing(AcquireError::Connection("refused".into()))),
        );
        let out = t.send_prompt(&InteractionRequest::new("claude", "hi", true, 30)).await;
        let err = out.metadata.error.unwrap();
        assert_eq!(err.code, ErrorCode::CdpDisconnected);
        assert_eq!(err.failure_stage.as_deref(), Some("acquire"));

        let t = BrowserTransport::new(
            "claude",
            AssistantConfig::claude(),
            Arc::new(FakeSource::failing(AcquireError::Page("no load".into()))),
        );
        let out = t.send_prompt(&InteractionRequest::new("claude", "hi", true, 30)).await;
        assert_eq!(out.error_code(), Some(ErrorCode::SelectorMissing));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspicious_banner_does_not_block() {
        let page = FakePage::ready("https://claude.ai/new");
        page.update_probe(|p: &mut PageProbe| {
            p.banners.push(Banner {
                selector: "[role='status']".to_string(),
                text: "Claude can make mistakes".to_string(),
            })
        });
        page.script_stats(vec![stats(0, 0, false)]);
        page.hold_stats(stats(1, 9, false));
        page.set_blocks(vec!["<p>hello</p>"]);
        let out = transport(page)
            .send_prompt(&InteractionRequest::new("claude", "hi", true, 30))
            .await;
        assert!(out.success);
        assert_eq!(out.metadata.warnings[0].code, WarningCode::SuspiciousPageState);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_timeout_does_not_overflow_deadline() {
        let page = FakePage::ready("https://claude.ai/new");
        page.script_stats(vec![stats(0, 0, false), stats(0, 0, true)]);
        page.hold_stats(stats(1, 12, false));
        page.set_blocks(vec!["<p>done</p>"]);
        let t = transport(page);

        let handle = tokio::spawn(async move {
            t.send_prompt(&InteractionRequest::new("claude", "hi", true, u64::MAX))
                .await
        });
        let out = handle.await.expect("send must not panic");
        assert!(out.success, "{:?}", out.metadata.error);
        assert_eq!(out.text(), "done");
    }

    #[tokio::test(start_paused = true)]
    async fn test_usage_limit_after_submit_is_rate_limited() {
        let page = FakePage::ready("https://claude.ai/new");
        page.script_stats(vec![stats(0, 0, false)]);
        page.hold_stats(stats(0, 0, true));
        page.banner_after_submit(Banner {
            selector: "[role='alert']".to_string(),
            text: "You've reached your usage limit".to_string(),
        });
        let out = transport(page.clone())
            .send_prompt(&InteractionRequest::new("claude", "hi", true, 60))
            .await;

        assert_eq!(page.submissions(), 1);
        let err = out.metadata.error.as_ref().unwrap();
        assert_eq!(err.code, ErrorCode::RateLimited);
        assert_eq!(err.failure_stage.as_deref(), Some("wait"));
        assert!(err.evidence.snippet.as_deref().unwrap().contains("usage limit"));
        assert!(out.metadata.elapsed_ms.unwrap() < 5000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_wall_at_deadline_wins_over_timeout() {
        let page = FakePage::ready("https://claude.ai/new");
        page.script_stats(vec![stats(0, 0, false)]);
        page.hold_stats(stats(0, 0, true));
        page.banner_after_submit(Banner {
            selector: "[role='dialog']".to_string(),
            text: "Your session has expired".to_string(),
        });
        let out = transport(page)
            .send_prompt(&InteractionRequest::new("claude", "hi", true, 0))
            .await;
        assert_eq!(out.error_code(), Some(ErrorCode::AuthRequired));
        assert_eq!(out.metadata.stage_log.failure_stage(), Some("wait"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_extract() {
        let page = FakePage::ready("https://claude.ai/new");
        page.script_stats(vec![stats(0, 0, false)]);
        page.hold_stats(stats(1, 20, false));
        page.fail_html(PageError::Disconnected("target closed".into()));
        let out = transport(page)
            .send_prompt(&InteractionRequest::new("claude", "hi", true, 30))
            .await;

        assert!(!out.success);
        let err = out.metadata.error.as_ref().unwrap();
        assert_eq!(err.code, ErrorCode::CdpDisconnected);
        assert_eq!(err.failure_stage.as_deref(), Some("extract"));
        assert!(out.metadata.stage_log.get("wait_complete").is_some());
        assert!(out.metadata.stage_log.get("extract_done").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spinner_without_new_block_never_reextracts_old_reply() {
        let page = FakePage::ready("https://claude.ai/chat/abc");
        page.script_stats(vec![stats(1, 40, false), stats(1, 40, true)]);
        page.hold_stats(stats(1, 40, false));
        page.set_blocks(vec!["<p>old</p>"]);
        let out = transport(page)
            .send_prompt(&InteractionRequest::new("claude", "hi", true, 30))
            .await;

        assert!(out.success, "{:?}", out.metadata.error);
        assert!(!out.text().contains("old"));
        assert_eq!(out.metadata.warnings.len(), 1);
        assert_eq!(out.metadata.warnings[0].code, WarningCode::EmptyResponse);
    }
}
