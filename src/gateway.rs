//! Viewer connections to live sessions.
//!
//! This is the transport-agnostic half of the streaming endpoint: path
//! parsing, attach, inbound message handling and detach. The WebSocket
//! binding in `api::terminal_ws` only moves frames.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::rate_limit::RateLimiter;
use crate::session::{AttachError, Session, SessionRegistry, ViewerFrame, ViewerId};

/// WebSocket close codes used by the streaming endpoint.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const AWAY: u16 = 1001;
    /// Malformed request path.
    pub const PROTOCOL: u16 = 1002;
    pub const POLICY: u16 = 1008;
    pub const ERROR: u16 = 1011;
    pub const AGAIN: u16 = 1013;
    /// Application range: no session with the requested id.
    pub const NOT_FOUND: u16 = 4404;
}

pub const TERMINAL_PATH_PREFIX: &str = "/api/terminals/";

/// Control messages are text frames with this prefix; anything else is input.
pub const RESIZE_PREFIX: &[u8] = b"\0resize:";

pub const RATE_LIMIT_NOTICE: &str = "\r\n\x1b[31mRate limit exceeded. Please slow down.\x1b[0m\r\n";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Invalid path")]
    InvalidPath,
    #[error("Terminal not found")]
    NotFound,
    #[error("Too many viewers")]
    TooManyViewers,
}

impl GatewayError {
    pub fn close_code(&self) -> u16 {
        match self {
            GatewayError::Unauthorized => close_code::POLICY,
            GatewayError::InvalidPath => close_code::PROTOCOL,
            GatewayError::NotFound => close_code::NOT_FOUND,
            GatewayError::TooManyViewers => close_code::AGAIN,
        }
    }
}

/// Extract the session id from `/api/terminals/<id>`.
pub fn parse_session_path(path: &str) -> Option<&str> {
    let path = path.split(|c: char| c == '?' || c == '#').next().unwrap_or_default();
    path.strip_prefix(TERMINAL_PATH_PREFIX)
        .filter(|id| !id.is_empty())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Resize { cols: f64, rows: f64 },
    Input(Bytes),
}

/// Classify one inbound message.
///
/// A resize payload is `<cols>,<rows>`; a part that does not parse as a
/// number becomes NaN and is clamped to the minimum later.
pub fn parse_inbound(data: Bytes) -> Inbound {
    if !data.starts_with(RESIZE_PREFIX) {
        return Inbound::Input(data);
    }
    let payload = String::from_utf8_lossy(&data[RESIZE_PREFIX.len()..]);
    let mut parts = payload.split(',');
    let mut number = || {
        parts
            .next()
            .map(|p| {
                let p = p.trim();
                // An empty field reads as zero, like any other invalid size.
                if p.is_empty() {
                    0.0
                } else {
                    p.parse::<f64>().unwrap_or(f64::NAN)
                }
            })
            .unwrap_or(f64::NAN)
    };
    let cols = number();
    let rows = number();
    Inbound::Resize { cols, rows }
}

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    Written,
    Resized { cols: u16, rows: u16 },
    RateLimited,
    /// The process rejected it; logged and recorded on the session.
    Failed,
}

/// A viewer attached to one session.
pub struct Connection {
    pub viewer: ViewerId,
    pub session: Arc<Session>,
}

impl Connection {
    pub fn session_id(&self) -> crate::session::SessionId {
        self.session.id
    }
}

#[derive(Clone)]
pub struct Gateway {
    registry: SessionRegistry,
    limiter: Arc<RateLimiter<ViewerId>>,
}

impl Gateway {
    pub fn new(registry: SessionRegistry, limiter: Arc<RateLimiter<ViewerId>>) -> Self {
        Self { registry, limiter }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn limiter(&self) -> &Arc<RateLimiter<ViewerId>> {
        &self.limiter
    }

    /// Resolve `path` to a session and attach a new viewer to it.
    ///
    /// The returned queue yields the replay (if any) first, then live output,
    /// and finally a `Close` frame when the session ends. A queue that ends
    /// without a `Close` frame means the viewer was dropped for being slow.
    pub fn connect(
        &self,
        path: &str,
    ) -> Result<(Connection, mpsc::Receiver<ViewerFrame>), GatewayError> {
        let id = parse_session_path(path).ok_or(GatewayError::InvalidPath)?;
        let session = self.registry.get_str(id).ok_or(GatewayError::NotFound)?;
        let viewer = ViewerId::next();
        let frames = session.attach(viewer).map_err(|e| match e {
            AttachError::Closed => GatewayError::NotFound,
            AttachError::TooManyViewers(_) => GatewayError::TooManyViewers,
        })?;
        tracing::debug!(session = %session.id, %viewer, "viewer attached");
        Ok((Connection { viewer, session }, frames))
    }

    /// Apply one inbound message from a viewer.
    pub fn handle_inbound(&self, conn: &Connection, data: Bytes) -> InboundOutcome {
        let config = self.registry.config();
        if !self.limiter.allow(
            &conn.viewer,
            config.rate_limit_window(),
            config.rate_limit_max_messages,
        ) {
            tracing::warn!(session = %conn.session.id, viewer = %conn.viewer, "rate limit exceeded");
            conn.session.notify(conn.viewer, RATE_LIMIT_NOTICE);
            return InboundOutcome::RateLimited;
        }

        conn.session.touch();
        match parse_inbound(data) {
            Inbound::Resize { cols, rows } => match conn.session.resize(cols, rows) {
                Ok((cols, rows)) => InboundOutcome::Resized { cols, rows },
                Err(_) => InboundOutcome::Failed,
            },
            Inbound::Input(data) => match conn.session.write(data) {
                Ok(()) => InboundOutcome::Written,
                Err(_) => InboundOutcome::Failed,
            },
        }
    }

    pub fn disconnect(&self, conn: Connection) {
        conn.session.detach(conn.viewer);
        self.limiter.forget(&conn.viewer);
        tracing::debug!(session = %conn.session.id, viewer = %conn.viewer, "viewer detached");
    }
}
