use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use super::injection::SurfaceHeuristics;
use super::{Ack, DeliveryBackend, DeliveryError};
use crate::models::{AgentConnection, DeliveryMethod, Message};

/// A page or app reachable over the debugging endpoint
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct DebugTarget {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "webSocketDebuggerUrl", default)]
    pub websocket_url: Option<String>,
}

impl DebugTarget {
    fn matches(&self, target_ref: &str) -> bool {
        let needle = target_ref.to_lowercase();
        self.id == target_ref
            || self.title.to_lowercase().contains(&needle)
            || self.url.to_lowercase().contains(&needle)
    }

    fn is_page(&self) -> bool {
        self.kind.is_empty() || self.kind == "page"
    }
}

/// An open script-evaluation session
#[async_trait]
pub trait DebugSession: Send {
    /// Evaluate `expression` and return its value.
    async fn evaluate(&mut self, expression: &str) -> Result<Value, DeliveryError>;

    async fn close(&mut self) -> Result<(), DeliveryError>;
}

#[async_trait]
pub trait DebugSessionProvider: Send + Sync {
    async fn list_targets(&self) -> Result<Vec<DebugTarget>, DeliveryError>;

    async fn open(&self, target: &DebugTarget) -> Result<Box<dyn DebugSession>, DeliveryError>;
}

/// Exact id first, then pages by title or url fragment, then anything matching.
pub fn select_target<'a>(targets: &'a [DebugTarget], target_ref: &str) -> Option<&'a DebugTarget> {
    targets
        .iter()
        .find(|t| t.id == target_ref)
        .or_else(|| targets.iter().find(|t| t.is_page() && t.matches(target_ref)))
        .or_else(|| targets.iter().find(|t| t.matches(target_ref)))
}

const INJECTION_SCRIPT: &str = r#"(() => {
  const cfg = __CONFIG__;
  try {
    const roots = [];
    const collect = (root) => {
      roots.push(root);
      for (const el of root.querySelectorAll('*')) {
        if (el.shadowRoot) collect(el.shadowRoot);
        if (el.tagName === 'IFRAME') {
          try { if (el.contentDocument) collect(el.contentDocument); } catch (_) {}
        }
      }
    };
    collect(document);
    const all = roots.flatMap((r) => Array.from(r.querySelectorAll('*')));
    const roleOf = (el) => (el.getAttribute('role') || el.tagName).toLowerCase();
    const labelOf = (el) => ['placeholder', 'aria-label', 'name', 'data-placeholder', 'title']
      .map((a) => el.getAttribute(a) || '').join(' ').toLowerCase();
    const hinted = (text, hints) => hints.some((h) => text.includes(h));
    const isEditable = (el) => {
      if (el.isContentEditable) return true;
      if (el.disabled || el.readOnly) return false;
      if (el.tagName === 'TEXTAREA') return true;
      return el.tagName === 'INPUT' && /^(text|search|)$/i.test(el.getAttribute('type') || '');
    };
    const isText = (el) => cfg.textRoles.includes(roleOf(el));

    const candidates = all.filter(isEditable);
    const surface = candidates.find((el) => isText(el) && hinted(labelOf(el), cfg.surfaceHints))
      || candidates.find(isText)
      || candidates[0];
    if (!surface) return { ok: false, reason: 'no_surface' };

    const view = surface.ownerDocument.defaultView || window;
    surface.focus();
    if (surface.isContentEditable) {
      surface.ownerDocument.execCommand('insertText', false, cfg.content);
    } else {
      const proto = surface.tagName === 'TEXTAREA'
        ? view.HTMLTextAreaElement.prototype
        : view.HTMLInputElement.prototype;
      Object.getOwnPropertyDescriptor(proto, 'value').set.call(surface, cfg.content);
    }
    surface.dispatchEvent(new view.Event('input', { bubbles: true }));

    const button = all.find((el) => roleOf(el) === 'button' && !el.disabled
      && hinted(((el.getAttribute('aria-label') || '') + ' ' + (el.textContent || '')).toLowerCase(), cfg.submitHints));
    if (button) {
      button.click();
      return { ok: true, surface: roleOf(surface), submitted: 'button' };
    }
    for (const type of ['keydown', 'keypress', 'keyup']) {
      surface.dispatchEvent(new view.KeyboardEvent(type, {
        key: cfg.commitKey, code: cfg.commitKey, bubbles: true, cancelable: true,
      }));
    }
    return { ok: true, surface: roleOf(surface), submitted: 'key' };
  } catch (e) {
    return { ok: false, reason: 'exception', error: String(e) };
  }
})()"#;

/// Render the in-page injection script for `content`.
///
/// All inputs are embedded as one JSON literal, so content never needs
/// escaping by hand.
pub fn build_injection_script(content: &str, heuristics: &SurfaceHeuristics) -> String {
    let lower = |items: &[String]| -> Vec<String> { items.iter().map(|s| s.to_lowercase()).collect() };
    let config = json!({
        "content": content,
        "textRoles": heuristics.text_roles(),
        "surfaceHints": lower(heuristics.surface_hints()),
        "submitHints": lower(heuristics.submit_hints()),
        "commitKey": heuristics.commit_key(),
    });
    INJECTION_SCRIPT.replace("__CONFIG__", &config.to_string())
}

const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct Verdict {
    ok: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    surface: Option<String>,
    #[serde(default)]
    submitted: Option<String>,
}

/// Delivers by evaluating the injection script in a remote-debug session.
pub struct RemoteDebugBackend<P: DebugSessionProvider> {
    provider: P,
    heuristics: SurfaceHeuristics,
    close_timeout: Duration,
}

impl<P: DebugSessionProvider> RemoteDebugBackend<P> {
    pub fn new(provider: P, heuristics: SurfaceHeuristics) -> Self {
        Self {
            provider,
            heuristics,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    /// Upper bound on closing a session. A close that overruns is abandoned.
    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    async fn close_session(&self, session: &mut dyn DebugSession, target: &DebugTarget) {
        match tokio::time::timeout(self.close_timeout, session.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to close debug session for {}: {}", target.id, e),
            Err(_) => warn!(
                "Closing debug session for {} took longer than {:?}, abandoning it",
                target.id, self.close_timeout
            ),
        }
    }
}

#[async_trait]
impl<P: DebugSessionProvider> DeliveryBackend for RemoteDebugBackend<P> {
    fn method(&self) -> DeliveryMethod {
        DeliveryMethod::RemoteProtocol
    }

    async fn deliver(
        &self,
        message: &mut Message,
        connection: &AgentConnection,
    ) -> Result<Ack, DeliveryError> {
        message.record_attempt();

        let targets = self.provider.list_targets().await?;
        let target = select_target(&targets, &connection.target_ref).ok_or_else(|| {
            DeliveryError::SessionUnavailable(format!(
                "no debug target matches '{}'",
                connection.target_ref
            ))
        })?;

        let mut session = self.provider.open(target).await?;
        let script = build_injection_script(&message.content, &self.heuristics);
        let outcome = session.evaluate(&script).await;
        self.close_session(session.as_mut(), target).await;

        let verdict: Verdict = serde_json::from_value(outcome?)
            .map_err(|e| DeliveryError::Script(format!("unexpected verdict: {e}")))?;
        if !verdict.ok {
            if verdict.reason.as_deref() == Some("no_surface") {
                return Err(DeliveryError::InputSurfaceNotFound(target.title.clone()));
            }
            return Err(DeliveryError::Script(
                verdict
                    .error
                    .or(verdict.reason)
                    .unwrap_or_else(|| "script reported failure".to_string()),
            ));
        }

        let surface = verdict.surface.unwrap_or_default();
        let submitted = verdict.submitted.unwrap_or_default();
        debug!(
            "Evaluated {} in '{}': surface {}, submitted by {}",
            message.id, target.title, surface, submitted
        );
        Ok(Ack::new(
            DeliveryMethod::RemoteProtocol,
            format!("{} in {} ({})", surface, target.title, submitted),
        ))
    }
}
