use async_trait::async_trait;
use std::process::{Output, Stdio};
use tokio::process::Command;

use super::injection::{InputDriver, UiElement, WindowHandle};
use super::DeliveryError;

/// Input driver over tmux: each pane is a window with one terminal surface.
///
/// `target_ref` is any tmux target, e.g. `session:0.1` or `%3`.
pub struct TmuxInputDriver {
    binary: String,
}

impl TmuxInputDriver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    async fn run(&self, args: &[&str]) -> Result<Output, DeliveryError> {
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DeliveryError::Driver(format!("failed to run {}: {}", self.binary, e)))
    }

    async fn run_checked(&self, args: &[&str]) -> Result<Output, DeliveryError> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(DeliveryError::Driver(format!(
                "{} {} failed: {}",
                self.binary,
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output)
    }
}

/// Parse `display-message` output of the form `<pane_id> <pane_title>`.
fn parse_pane_line(line: &str) -> Option<WindowHandle> {
    let line = line.trim();
    let (id, title) = match line.split_once(' ') {
        Some((id, title)) => (id, title.trim()),
        None => (line, ""),
    };
    if !id.starts_with('%') {
        return None;
    }
    Some(WindowHandle {
        id: id.to_string(),
        title: if title.is_empty() { id } else { title }.to_string(),
    })
}

#[async_trait]
impl InputDriver for TmuxInputDriver {
    async fn find_window(&self, target_ref: &str) -> Result<Option<WindowHandle>, DeliveryError> {
        let output = self
            .run(&["display-message", "-p", "-t", target_ref, "#{pane_id} #{pane_title}"])
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(parse_pane_line(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn list_elements(&self, window: &WindowHandle) -> Result<Vec<UiElement>, DeliveryError> {
        Ok(vec![UiElement {
            id: window.id.clone(),
            role: "terminal".to_string(),
            name: window.title.clone(),
            placeholder: String::new(),
            editable: true,
        }])
    }

    async fn focus(&self, _window: &WindowHandle, element: &UiElement) -> Result<(), DeliveryError> {
        self.run_checked(&["select-pane", "-t", &element.id]).await?;
        Ok(())
    }

    async fn type_text(
        &self,
        _window: &WindowHandle,
        element: &UiElement,
        text: &str,
    ) -> Result<(), DeliveryError> {
        self.run_checked(&["send-keys", "-t", &element.id, "-l", text])
            .await?;
        Ok(())
    }

    async fn click(&self, _window: &WindowHandle, _element: &UiElement) -> Result<(), DeliveryError> {
        Err(DeliveryError::NotImplemented(
            "tmux panes have no clickable controls".to_string(),
        ))
    }

    async fn press_key(&self, window: &WindowHandle, key: &str) -> Result<(), DeliveryError> {
        self.run_checked(&["send-keys", "-t", &window.id, key]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pane_line_reads_id_and_title() {
        let window = parse_pane_line("%3 claude-builder\n").unwrap();
        assert_eq!(window.id, "%3");
        assert_eq!(window.title, "claude-builder");
    }

    #[test]
    fn parse_pane_line_uses_id_for_untitled_pane() {
        let window = parse_pane_line("%12\n").unwrap();
        assert_eq!(window.title, "%12");
    }

    #[test]
    fn parse_pane_line_rejects_garbage() {
        assert!(parse_pane_line("").is_none());
        assert!(parse_pane_line("no server running").is_none());
    }

    #[tokio::test]
    async fn each_pane_exposes_one_terminal_surface() {
        let driver = TmuxInputDriver::new("tmux");
        let window = WindowHandle {
            id: "%1".into(),
            title: "agent".into(),
        };
        let elements = driver.list_elements(&window).await.unwrap();

        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].role, "terminal");
        assert!(elements[0].editable);
    }

    #[tokio::test]
    async fn missing_binary_is_a_driver_error() {
        let driver = TmuxInputDriver::new("/nonexistent/tmux-binary");
        let err = driver.find_window("s:0.0").await.unwrap_err();
        assert!(matches!(err, DeliveryError::Driver(_)));
    }
}
