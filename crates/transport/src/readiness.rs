//! Ensure-ready classification of a page probe.
//!
//! Precedence, first match wins: auth wall, rate limit, unusable input.
//! Banners matching neither pattern set are reported as warnings and never
//! block the send.

use chatcell_core::{
    make_snippet, ErrorCode, ErrorRecord, Evidence, SelectorConfig, Warning, WarningCode,
};

use crate::page::{Banner, PageProbe};

pub const STAGE_ENSURE_READY: &str = "ensure_ready";
pub const STAGE_SEND: &str = "send";

#[derive(Debug)]
pub enum Readiness {
    Ready { warnings: Vec<Warning> },
    Blocked { error: ErrorRecord, stage: &'static str },
}

fn matches_any(text: &str, patterns: &[String]) -> bool {
    let lower = text.to_lowercase();
    patterns
        .iter()
        .any(|p| !p.is_empty() && lower.contains(&p.to_lowercase()))
}

fn banner_evidence(banner: &Banner, page_url: &str) -> Evidence {
    Evidence::selector(&banner.selector)
        .with_snippet(make_snippet(&banner.text))
        .with_page_url(Some(page_url.to_string()).filter(|u| !u.is_empty()))
}

fn page_url(probe: &PageProbe) -> Option<String> {
    Some(probe.url.clone()).filter(|u| !u.is_empty())
}

pub fn assess(probe: &PageProbe, selectors: &SelectorConfig) -> Readiness {
    if let Some(sel) = &probe.auth_indicator {
        return Readiness::Blocked {
            error: ErrorRecord::new(ErrorCode::AuthRequired, "Sign-in required on the assistant page")
                .with_evidence(Evidence::selector(sel).with_page_url(page_url(probe))),
            stage: STAGE_ENSURE_READY,
        };
    }
    if let Some(banner) = probe
        .banners
        .iter()
        .find(|b| matches_any(&b.text, &selectors.auth_patterns))
    {
        return Readiness::Blocked {
            error: ErrorRecord::new(ErrorCode::AuthRequired, "Page reports that sign-in is required")
                .with_evidence(banner_evidence(banner, &probe.url)),
            stage: STAGE_ENSURE_READY,
        };
    }

    if let Some(sel) = &probe.rate_limit_indicator {
        return Readiness::Blocked {
            error: ErrorRecord::new(ErrorCode::RateLimited, "Rate-limit indicator visible on the page")
                .with_evidence(Evidence::selector(sel).with_page_url(page_url(probe))),
            stage: STAGE_SEND,
        };
    }
    if let Some(banner) = probe
        .banners
        .iter()
        .find(|b| matches_any(&b.text, &selectors.rate_limit_patterns))
    {
        return Readiness::Blocked {
            error: ErrorRecord::new(ErrorCode::RateLimited, "Page reports a usage or rate limit")
                .with_evidence(banner_evidence(banner, &probe.url)),
            stage: STAGE_SEND,
        };
    }

    if !probe.input_present || !probe.input_enabled {
        let message = if probe.input_present {
            "Prompt input is present but not usable"
        } else {
            "Prompt input not found on the page"
        };
        return Readiness::Blocked {
            error: ErrorRecord::new(ErrorCode::SelectorMissing, message)
                .with_evidence(Evidence::selector(&selectors.input).with_page_url(page_url(probe))),
            stage: STAGE_ENSURE_READY,
        };
    }

    let warnings = probe
        .banners
        .iter()
        .map(|b| {
            Warning::new(
                WarningCode::SuspiciousPageState,
                "Unrecognized status banner visible on the page",
            )
            .with_evidence(banner_evidence(b, &probe.url))
        })
        .collect();
    Readiness::Ready { warnings }
}
