//! JavaScript evaluated in the assistant's tab.
//!
//! Selectors and text are embedded as JSON string literals, so no escaping
//! is done by hand. Every script is a self-invoking expression returning a
//! JSON-serializable value.

use chatcell_core::SelectorConfig;

fn lit(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

fn lit_opt(s: Option<&str>) -> String {
    s.map(lit).unwrap_or_else(|| "null".to_string())
}

fn lit_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

const VISIBLE_FN: &str = "const visible = (el) => !!el && !!(el.offsetWidth || el.offsetHeight || el.getClientRects().length);\
 const q = (sel) => { try { return document.querySelector(sel); } catch (e) { return null; } };\
 const qa = (sel) => { try { return Array.from(document.querySelectorAll(sel)); } catch (e) { return []; } };";

pub fn probe(selectors: &SelectorConfig) -> String {
    format!(
        "(() => {{ {visible} \
         const input = q({input}); \
         const enabled = !!input && !input.disabled && input.getAttribute('aria-disabled') !== 'true' \
           && (input.isContentEditable || input.tagName === 'TEXTAREA' || input.tagName === 'INPUT') && visible(input); \
         const firstVisible = (list) => {{ for (const s of list) {{ if (qa(s).some(visible)) return s; }} return null; }}; \
         const banners = []; \
         for (const s of {banners}) {{ for (const el of qa(s)) {{ \
           if (!visible(el)) continue; \
           const text = (el.innerText || el.textContent || '').trim(); \
           if (text) banners.push({{ selector: s, text: text.slice(0, 500) }}); }} }} \
         return {{ inputPresent: !!input, inputEnabled: enabled, \
           authIndicator: firstVisible({auth}), rateLimitIndicator: firstVisible({rate}), \
           banners, url: window.location.href }}; }})()",
        visible = VISIBLE_FN,
        input = lit(&selectors.input),
        banners = lit_list(&selectors.status_banners),
        auth = lit_list(&selectors.auth_indicators),
        rate = lit_list(&selectors.rate_limit_selectors),
    )
}

pub fn response_stats(selectors: &SelectorConfig) -> String {
    format!(
        "(() => {{ {visible} \
         const blocks = qa({block}); \
         const last = blocks.length ? blocks[blocks.length - 1] : null; \
         const gen = {generating}; \
         return {{ count: blocks.length, lastSize: last ? last.innerHTML.length : 0, \
           generating: gen ? qa(gen).some(visible) : false }}; }})()",
        visible = VISIBLE_FN,
        block = lit(&selectors.response_block),
        generating = lit_opt(selectors.generating.as_deref()),
    )
}

/// Focus the input and clear any draft text. Returns false if missing.
pub fn focus_and_clear(selector: &str) -> String {
    format!(
        "(() => {{ const el = document.querySelector({sel}); if (!el) return false; \
         el.scrollIntoView({{block: 'center'}}); el.focus(); \
         if ('value' in el && !el.isContentEditable) {{ el.value = ''; }} \
         else {{ document.execCommand('selectAll', false, null); document.execCommand('delete', false, null); }} \
         return true; }})()",
        sel = lit(selector),
    )
}

pub fn dispatch_input(selector: &str) -> String {
    format!(
        "(() => {{ const el = document.querySelector({sel}); \
         if (el) el.dispatchEvent(new Event('input', {{bubbles: true}})); return !!el; }})()",
        sel = lit(selector),
    )
}

/// Click an enabled element. Returns false if it is missing or disabled.
pub fn click(selector: &str) -> String {
    format!(
        "(() => {{ const el = document.querySelector({sel}); \
         if (!el || el.disabled) return false; \
         el.scrollIntoView({{block: 'center'}}); el.click(); return true; }})()",
        sel = lit(selector),
    )
}

pub fn outer_html_at(selector: &str, index: usize) -> String {
    format!(
        "(() => {{ const els = document.querySelectorAll({sel}); \
         return els.length > {idx} ? els[{idx}].outerHTML : null; }})()",
        sel = lit(selector),
        idx = index,
    )
}

pub fn inner_text(selector: &str) -> String {
    format!(
        "(() => {{ const el = document.querySelector({sel}); \
         const t = el ? (el.innerText || el.textContent || '').trim() : ''; return t || null; }})()",
        sel = lit(selector),
    )
}

pub fn links(selector: &str) -> String {
    format!(
        "(() => Array.from(document.querySelectorAll({sel})).map((a) => ({{ \
         href: a.href || a.getAttribute('href') || '', \
         text: (a.innerText || a.textContent || '').trim() }})))()",
        sel = lit(selector),
    )
}

/// User and assistant messages in document order.
pub fn messages(selectors: &SelectorConfig) -> String {
    format!(
        "(() => {{ const out = []; \
         const user = {user}; const asst = {asst}; \
         const nodes = Array.from(document.querySelectorAll(user ? user + ', ' + asst : asst)); \
         for (const el of nodes) {{ \
           const role = user && el.matches(user) ? 'user' : 'assistant'; \
           out.push({{ role, html: el.outerHTML }}); }} \
         return out; }})()",
        user = lit_opt(selectors.user_message.as_deref()),
        asst = lit(&selectors.response_block),
    )
}

pub const LOCATION_HREF: &str = "window.location.href";
pub const DOCUMENT_TITLE: &str = "document.title";
