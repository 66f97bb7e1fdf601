//! Traffic Rendering
//!
//! Console rendering of relayed chunks for the command-line front end.
//! Capture hooks only copy chunks into a channel and always pass them on
//! unmodified; a separate printer task does the formatting so console I/O
//! never runs on the relay pump.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::debug;

use crate::relay::{Adaptor, Decision, Direction, InterceptionHook};

/// How observed traffic is printed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    #[serde(alias = "n")]
    None,
    /// Upper-case hex bytes separated by spaces
    #[serde(alias = "b")]
    Binary,
    /// UTF-8, invalid sequences replaced
    #[serde(alias = "s")]
    String,
}

impl OutputMode {
    /// Parse a command-line value. Unknown values select `None`.
    pub fn from_arg(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "b" | "binary" => OutputMode::Binary,
            "s" | "string" => OutputMode::String,
            _ => OutputMode::None,
        }
    }
}

/// A chunk seen by a capture hook
#[derive(Debug, Clone)]
pub struct Capture {
    pub direction: Direction,
    pub data: Bytes,
}

/// Observing hook feeding the printer channel
pub struct CaptureHook {
    direction: Direction,
    tx: mpsc::UnboundedSender<Capture>,
}

impl CaptureHook {
    pub fn new(direction: Direction, tx: mpsc::UnboundedSender<Capture>) -> Self {
        Self { direction, tx }
    }
}

impl InterceptionHook for CaptureHook {
    fn intercept(&self, chunk: Bytes) -> anyhow::Result<Decision> {
        let capture = Capture {
            direction: self.direction,
            data: chunk.clone(),
        };
        if self.tx.send(capture).is_err() {
            debug!("Capture printer is gone, {} chunk not rendered", self.direction);
        }
        Ok(Decision::pass(chunk))
    }
}

/// Register capture hooks on both directions of `adaptor` and return the
/// receiving end of the capture channel
pub fn install_capture(adaptor: &Adaptor) -> mpsc::UnboundedReceiver<Capture> {
    let (tx, rx) = mpsc::unbounded_channel();
    adaptor.set_listener_hook(CaptureHook::new(Direction::ListenerToTarget, tx.clone()));
    adaptor.set_target_hook(CaptureHook::new(Direction::TargetToListener, tx));
    rx
}

/// Header line naming the endpoints and the direction of travel
pub fn format_header(direction: Direction, listen: SocketAddr, target: SocketAddr) -> String {
    match direction {
        Direction::ListenerToTarget => format!("[{} -> {}]", listen, target),
        Direction::TargetToListener => format!("[{} <- {}]", listen, target),
    }
}

pub fn format_hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02X}", byte);
    }
    out
}

/// Render a capture for `mode`; `None` mode renders nothing
pub fn render(
    mode: OutputMode,
    capture: &Capture,
    listen: SocketAddr,
    target: SocketAddr,
) -> Option<String> {
    let body = match mode {
        OutputMode::None => return None,
        OutputMode::Binary => format_hex(&capture.data),
        OutputMode::String => String::from_utf8_lossy(&capture.data).into_owned(),
    };
    Some(format!(
        "{}\n{}",
        format_header(capture.direction, listen, target),
        body
    ))
}

/// Print captures until every sender is dropped
pub async fn run_printer(
    mut rx: mpsc::UnboundedReceiver<Capture>,
    mode: OutputMode,
    listen: SocketAddr,
    target: SocketAddr,
) {
    while let Some(capture) = rx.recv().await {
        if let Some(text) = render(mode, &capture, listen, target) {
            println!("{}", text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::Action;

    fn endpoints() -> (SocketAddr, SocketAddr) {
        ("127.0.0.1:8000".parse().unwrap(), "10.0.0.2:502".parse().unwrap())
    }

    #[test]
    fn test_output_mode_from_arg() {
        assert_eq!(OutputMode::from_arg("B"), OutputMode::Binary);
        assert_eq!(OutputMode::from_arg("s"), OutputMode::String);
        assert_eq!(OutputMode::from_arg("N"), OutputMode::None);
        assert_eq!(OutputMode::from_arg("garbage"), OutputMode::None);
    }

    #[test]
    fn test_format_hex() {
        assert_eq!(format_hex(&[0x00, 0x0a, 0xff]), "00 0A FF");
        assert_eq!(format_hex(&[]), "");
    }

    #[test]
    fn test_render_modes() {
        let (listen, target) = endpoints();
        let capture = Capture {
            direction: Direction::TargetToListener,
            data: Bytes::from_static(b"OK"),
        };

        assert_eq!(render(OutputMode::None, &capture, listen, target), None);
        assert_eq!(
            render(OutputMode::Binary, &capture, listen, target).unwrap(),
            "[127.0.0.1:8000 <- 10.0.0.2:502]\n4F 4B"
        );
        assert_eq!(
            render(OutputMode::String, &capture, listen, target).unwrap(),
            "[127.0.0.1:8000 <- 10.0.0.2:502]\nOK"
        );
    }

    #[test]
    fn test_capture_hook_passes_unmodified() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let hook = CaptureHook::new(Direction::ListenerToTarget, tx);

        let decision = hook.intercept(Bytes::from_static(b"PING")).unwrap();
        assert_eq!(decision.action, Action::Pass);
        assert_eq!(&decision.data[..], b"PING");

        let capture = rx.try_recv().unwrap();
        assert_eq!(capture.direction, Direction::ListenerToTarget);
        assert_eq!(&capture.data[..], b"PING");
    }

    #[test]
    fn test_capture_hook_survives_closed_channel() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let hook = CaptureHook::new(Direction::TargetToListener, tx);
        assert!(hook.intercept(Bytes::from_static(b"x")).is_ok());
    }
}
