use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use super::{Ack, DeliveryBackend, DeliveryError};
use crate::config::InjectionConfig;
use crate::models::{AgentConnection, DeliveryMethod, Message};

/// A top-level window found for an agent's `target_ref`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowHandle {
    pub id: String,
    pub title: String,
}

/// An accessible UI element inside a window
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UiElement {
    pub id: String,
    pub role: String,
    pub name: String,
    pub placeholder: String,
    pub editable: bool,
}

/// OS-level synthetic input
#[async_trait]
pub trait InputDriver: Send + Sync {
    async fn find_window(&self, target_ref: &str) -> Result<Option<WindowHandle>, DeliveryError>;

    async fn list_elements(&self, window: &WindowHandle) -> Result<Vec<UiElement>, DeliveryError>;

    async fn focus(&self, window: &WindowHandle, element: &UiElement) -> Result<(), DeliveryError>;

    async fn type_text(
        &self,
        window: &WindowHandle,
        element: &UiElement,
        text: &str,
    ) -> Result<(), DeliveryError>;

    async fn click(&self, window: &WindowHandle, element: &UiElement) -> Result<(), DeliveryError>;

    async fn press_key(&self, window: &WindowHandle, key: &str) -> Result<(), DeliveryError>;
}

fn hint_pattern(hints: &[String]) -> Result<Option<Regex>, regex::Error> {
    let alternatives: Vec<String> = hints
        .iter()
        .filter(|h| !h.trim().is_empty())
        .map(|h| regex::escape(h.trim()))
        .collect();
    if alternatives.is_empty() {
        return Ok(None);
    }
    Regex::new(&format!("(?i){}", alternatives.join("|"))).map(Some)
}

/// Ordered rules for choosing the input surface and submit control.
#[derive(Debug, Clone)]
pub struct SurfaceHeuristics {
    text_roles: Vec<String>,
    surface_hints: Vec<String>,
    submit_hints: Vec<String>,
    surface_pattern: Option<Regex>,
    submit_pattern: Option<Regex>,
    commit_key: String,
}

impl SurfaceHeuristics {
    pub fn new(
        text_roles: Vec<String>,
        surface_hints: Vec<String>,
        submit_hints: Vec<String>,
        commit_key: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            surface_pattern: hint_pattern(&surface_hints)?,
            submit_pattern: hint_pattern(&submit_hints)?,
            text_roles: text_roles.into_iter().map(|r| r.to_lowercase()).collect(),
            surface_hints,
            submit_hints,
            commit_key: commit_key.into(),
        })
    }

    pub fn from_config(config: &InjectionConfig) -> Result<Self, regex::Error> {
        Self::new(
            config.text_roles.clone(),
            config.surface_hints.clone(),
            config.submit_hints.clone(),
            config.commit_key.clone(),
        )
    }

    pub fn text_roles(&self) -> &[String] {
        &self.text_roles
    }

    pub fn surface_hints(&self) -> &[String] {
        &self.surface_hints
    }

    pub fn submit_hints(&self) -> &[String] {
        &self.submit_hints
    }

    pub fn commit_key(&self) -> &str {
        &self.commit_key
    }

    fn is_text_role(&self, element: &UiElement) -> bool {
        let role = element.role.to_lowercase();
        self.text_roles.iter().any(|r| *r == role)
    }

    fn matches_surface_hint(&self, element: &UiElement) -> bool {
        self.surface_pattern
            .as_ref()
            .is_some_and(|p| p.is_match(&element.placeholder) || p.is_match(&element.name))
    }

    /// Choose the element to type into.
    ///
    /// Rules, first match wins:
    /// 1. editable, text role, placeholder or name matches a surface hint
    /// 2. editable, text role
    /// 3. editable
    pub fn pick_surface<'a>(&self, elements: &'a [UiElement]) -> Option<&'a UiElement> {
        let editable = || elements.iter().filter(|e| e.editable);
        editable()
            .find(|e| self.is_text_role(e) && self.matches_surface_hint(e))
            .or_else(|| editable().find(|e| self.is_text_role(e)))
            .or_else(|| editable().next())
    }

    /// A button whose name matches a submit hint, if any.
    pub fn pick_submit<'a>(&self, elements: &'a [UiElement]) -> Option<&'a UiElement> {
        let pattern = self.submit_pattern.as_ref()?;
        elements
            .iter()
            .find(|e| e.role.eq_ignore_ascii_case("button") && pattern.is_match(&e.name))
    }
}

/// Types the message into the agent's window through an `InputDriver`.
pub struct DirectInjectionBackend<D: InputDriver> {
    driver: D,
    heuristics: SurfaceHeuristics,
}

impl<D: InputDriver> DirectInjectionBackend<D> {
    pub fn new(driver: D, heuristics: SurfaceHeuristics) -> Self {
        Self { driver, heuristics }
    }
}

#[async_trait]
impl<D: InputDriver> DeliveryBackend for DirectInjectionBackend<D> {
    fn method(&self) -> DeliveryMethod {
        DeliveryMethod::DirectInjection
    }

    async fn deliver(
        &self,
        message: &mut Message,
        connection: &AgentConnection,
    ) -> Result<Ack, DeliveryError> {
        message.record_attempt();

        let window = self
            .driver
            .find_window(&connection.target_ref)
            .await?
            .ok_or_else(|| DeliveryError::TargetNotFound(connection.target_ref.clone()))?;

        let elements = self.driver.list_elements(&window).await?;
        let surface = self
            .heuristics
            .pick_surface(&elements)
            .ok_or_else(|| DeliveryError::InputSurfaceNotFound(window.title.clone()))?;

        self.driver.focus(&window, surface).await?;
        self.driver
            .type_text(&window, surface, &message.content)
            .await?;

        let submitted_by = match self.heuristics.pick_submit(&elements) {
            Some(button) => {
                self.driver.click(&window, button).await?;
                format!("button '{}'", button.name)
            }
            None => {
                self.driver
                    .press_key(&window, self.heuristics.commit_key())
                    .await?;
                format!("key {}", self.heuristics.commit_key())
            }
        };

        debug!(
            "Injected {} into {} ({} '{}'), submitted by {}",
            message.id, window.title, surface.role, surface.name, submitted_by
        );
        Ok(Ack::new(
            DeliveryMethod::DirectInjection,
            format!("{} '{}' in {}", surface.role, surface.name, window.title),
        ))
    }
}

#[cfg(test)]
pub(crate) mod mock_driver {
    use super::*;
    use std::sync::Mutex;

    /// In-memory window with a fixed element list; records every action.
    pub struct MockInputDriver {
        pub window: Option<WindowHandle>,
        pub elements: Vec<UiElement>,
        pub actions: Mutex<Vec<String>>,
    }

    impl MockInputDriver {
        pub fn with_elements(elements: Vec<UiElement>) -> Self {
            Self {
                window: Some(WindowHandle {
                    id: "w1".into(),
                    title: "Agent Window".into(),
                }),
                elements,
                actions: Mutex::new(Vec::new()),
            }
        }

        pub fn without_window() -> Self {
            Self {
                window: None,
                elements: Vec::new(),
                actions: Mutex::new(Vec::new()),
            }
        }

        pub fn actions(&self) -> Vec<String> {
            self.actions.lock().unwrap().clone()
        }

        fn record(&self, action: String) {
            self.actions.lock().unwrap().push(action);
        }
    }

    #[async_trait]
    impl InputDriver for MockInputDriver {
        async fn find_window(&self, _target_ref: &str) -> Result<Option<WindowHandle>, DeliveryError> {
            Ok(self.window.clone())
        }

        async fn list_elements(&self, _window: &WindowHandle) -> Result<Vec<UiElement>, DeliveryError> {
            Ok(self.elements.clone())
        }

        async fn focus(&self, _window: &WindowHandle, element: &UiElement) -> Result<(), DeliveryError> {
            self.record(format!("focus:{}", element.id));
            Ok(())
        }

        async fn type_text(
            &self,
            _window: &WindowHandle,
            element: &UiElement,
            text: &str,
        ) -> Result<(), DeliveryError> {
            self.record(format!("type:{}:{}", element.id, text));
            Ok(())
        }

        async fn click(&self, _window: &WindowHandle, element: &UiElement) -> Result<(), DeliveryError> {
            self.record(format!("click:{}", element.id));
            Ok(())
        }

        async fn press_key(&self, _window: &WindowHandle, key: &str) -> Result<(), DeliveryError> {
            self.record(format!("key:{key}"));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock_driver::MockInputDriver;
    use super::*;

    fn heuristics() -> SurfaceHeuristics {
        SurfaceHeuristics::new(
            vec!["textarea".into(), "edit".into()],
            vec!["message".into(), "prompt".into()],
            vec!["send".into(), "submit".into()],
            "Enter",
        )
        .unwrap()
    }

    fn element(id: &str, role: &str, name: &str, placeholder: &str, editable: bool) -> UiElement {
        UiElement {
            id: id.into(),
            role: role.into(),
            name: name.into(),
            placeholder: placeholder.into(),
            editable,
        }
    }

    #[test]
    fn surface_prefers_hinted_text_role() {
        let elements = vec![
            element("search", "edit", "Search", "", true),
            element("chat", "textarea", "", "Type a message...", true),
        ];
        assert_eq!(heuristics().pick_surface(&elements).unwrap().id, "chat");
    }

    #[test]
    fn surface_falls_back_to_any_text_role() {
        let elements = vec![
            element("combo", "combobox", "Prompt", "", true),
            element("notes", "Edit", "Notes", "", true),
        ];
        assert_eq!(heuristics().pick_surface(&elements).unwrap().id, "notes");
    }

    #[test]
    fn surface_falls_back_to_any_editable() {
        let elements = vec![
            element("label", "text", "Prompt", "", false),
            element("combo", "combobox", "", "", true),
        ];
        assert_eq!(heuristics().pick_surface(&elements).unwrap().id, "combo");
    }

    #[test]
    fn no_editable_element_means_no_surface() {
        let elements = vec![element("label", "textarea", "message", "", false)];
        assert!(heuristics().pick_surface(&elements).is_none());
    }

    #[test]
    fn submit_requires_button_role_and_hint() {
        let elements = vec![
            element("link", "link", "Send feedback", "", false),
            element("cancel", "button", "Cancel", "", false),
            element("go", "button", "Send message", "", false),
        ];
        assert_eq!(heuristics().pick_submit(&elements).unwrap().id, "go");
        assert!(heuristics().pick_submit(&elements[..2]).is_none());
    }

    #[test]
    fn empty_hints_never_match() {
        let h = SurfaceHeuristics::new(vec!["textarea".into()], vec![], vec![], "Enter").unwrap();
        let elements = vec![element("go", "button", "Send", "", false)];
        assert!(h.pick_submit(&elements).is_none());
    }

    #[tokio::test]
    async fn deliver_types_and_clicks_submit() {
        let driver = MockInputDriver::with_elements(vec![
            element("input", "textarea", "", "Ask anything", true),
            element("send", "button", "Send", "", false),
        ]);
        let backend = DirectInjectionBackend::new(driver, heuristics());
        let mut message = Message::new("a", "b", "hello");
        let connection = AgentConnection::new("b", "B", "Agent Window");

        let ack = backend.deliver(&mut message, &connection).await.unwrap();
        assert_eq!(ack.method, DeliveryMethod::DirectInjection);
        assert_eq!(message.attempt_count, 1);
        assert_eq!(
            backend.driver.actions(),
            vec!["focus:input", "type:input:hello", "click:send"]
        );
    }

    #[tokio::test]
    async fn deliver_presses_commit_key_without_submit_control() {
        let driver = MockInputDriver::with_elements(vec![element("pane", "terminal", "", "", true)]);
        let backend = DirectInjectionBackend::new(driver, heuristics());
        let mut message = Message::new("a", "b", "run tests");

        backend
            .deliver(&mut message, &AgentConnection::new("b", "B", "t"))
            .await
            .unwrap();
        assert_eq!(
            backend.driver.actions(),
            vec!["focus:pane", "type:pane:run tests", "key:Enter"]
        );
    }

    #[tokio::test]
    async fn missing_window_is_target_not_found() {
        let backend = DirectInjectionBackend::new(MockInputDriver::without_window(), heuristics());
        let mut message = Message::new("a", "b", "x");

        let err = backend
            .deliver(&mut message, &AgentConnection::new("b", "B", "gone"))
            .await
            .unwrap_err();
        assert_eq!(err, DeliveryError::TargetNotFound("gone".into()));
        assert_eq!(message.attempt_count, 1);
    }

    #[tokio::test]
    async fn missing_surface_touches_nothing() {
        let driver = MockInputDriver::with_elements(vec![element("ok", "button", "OK", "", false)]);
        let backend = DirectInjectionBackend::new(driver, heuristics());
        let mut message = Message::new("a", "b", "x");

        let err = backend
            .deliver(&mut message, &AgentConnection::new("b", "B", "t"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::InputSurfaceNotFound(_)));
        assert!(backend.driver.actions().is_empty());
    }
}
