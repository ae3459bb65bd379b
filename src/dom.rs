use anyhow::{Context, Result};
use headless_chrome::Tab;
use std::sync::Arc;

use crate::types::{Link, PageSnapshot};

const TEXT_JS: &str = "document.body ? (document.body.innerText || '') : ''";

const HTML_JS: &str = "document.documentElement ? (document.documentElement.outerHTML || '') : ''";

/// Serialized as a string so the whole array comes back by value rather than
/// as a remote object handle.
const LINKS_JS: &str = r#"
JSON.stringify(Array.from(document.querySelectorAll('a')).map(a => ({
  href: a.href || '',
  text: a.innerText || ''
})))
"#;

/// Raw `action` attribute, not the resolved `form.action` property: an absent
/// attribute must read as null rather than the page URL.
const FORM_ACTION_JS: &str = r#"
(() => {
  const form = document.querySelector('form');
  return form ? form.getAttribute('action') : null;
})()
"#;

fn eval_string(tab: &Arc<Tab>, script: &str) -> Result<Option<String>> {
    let result = tab.evaluate(script, false)?;
    Ok(result.value.and_then(|v| v.as_str().map(String::from)))
}

pub fn page_text(tab: &Arc<Tab>) -> Result<String> {
    Ok(eval_string(tab, TEXT_JS)?.unwrap_or_default())
}

pub fn page_html(tab: &Arc<Tab>) -> Result<String> {
    Ok(eval_string(tab, HTML_JS)?.unwrap_or_default())
}

pub fn page_links(tab: &Arc<Tab>) -> Result<Vec<Link>> {
    match eval_string(tab, LINKS_JS)? {
        Some(raw) => serde_json::from_str(&raw).context("decoding link list"),
        None => Ok(Vec::new()),
    }
}

/// `action` of the first form on the page. Lookup failures read as "no form".
pub fn form_action(tab: &Arc<Tab>) -> Option<String> {
    eval_string(tab, FORM_ACTION_JS)
        .ok()
        .flatten()
        .filter(|a| !a.trim().is_empty())
}

pub fn capture_snapshot(tab: &Arc<Tab>) -> Result<PageSnapshot> {
    Ok(PageSnapshot {
        text: page_text(tab)?,
        html: page_html(tab)?,
        links: page_links(tab)?,
        form_action: form_action(tab),
    })
}
