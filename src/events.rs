//! Notifications exchanged between the supervisor, the update checker and
//! whoever is listening on the bus.
//!
//! Each `Notification` belongs to exactly one `Topic`; subscribers register
//! per topic. `wire_name` gives the event name used on the IPC boundary
//! (`webServerStarted`, `updateProgress`, ...).

use serde_json::{json, Value};

use crate::output::StreamKind;
use crate::update::UpdateInfo;

/// Channel names on the notification bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    ServiceStarted,
    ServiceStopped,
    ServiceLog,
    UpdateAvailable,
    UpdateError,
    UpdateNotAvailable,
    UpdateProgress,
    UpdateDownloaded,
    UpdateCancelled,
}

impl Topic {
    pub const ALL: [Topic; 9] = [
        Topic::ServiceStarted,
        Topic::ServiceStopped,
        Topic::ServiceLog,
        Topic::UpdateAvailable,
        Topic::UpdateError,
        Topic::UpdateNotAvailable,
        Topic::UpdateProgress,
        Topic::UpdateDownloaded,
        Topic::UpdateCancelled,
    ];
}

/// A single event published on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A supervised service printed its success marker.
    ServiceStarted { service: String, pid: u32 },
    /// A supervised service is no longer running. `error` carries the
    /// message shown to the user when it failed rather than stopped.
    ServiceStopped { service: String, error: Option<String> },
    /// A line of output from a supervised service.
    ServiceLog {
        service: String,
        stream: StreamKind,
        line: String,
    },
    /// A newer release exists.
    UpdateAvailable(UpdateInfo),
    /// The update check or download failed.
    UpdateError(String),
    /// The running build is current.
    UpdateNotAvailable(UpdateInfo),
    /// Download progress in percent.
    UpdateProgress(u8),
    /// The update is downloaded and can be installed.
    UpdateDownloaded(UpdateInfo),
    /// The download was cancelled.
    UpdateCancelled(UpdateInfo),
}

impl Notification {
    pub fn topic(&self) -> Topic {
        match self {
            Notification::ServiceStarted { .. } => Topic::ServiceStarted,
            Notification::ServiceStopped { .. } => Topic::ServiceStopped,
            Notification::ServiceLog { .. } => Topic::ServiceLog,
            Notification::UpdateAvailable(_) => Topic::UpdateAvailable,
            Notification::UpdateError(_) => Topic::UpdateError,
            Notification::UpdateNotAvailable(_) => Topic::UpdateNotAvailable,
            Notification::UpdateProgress(_) => Topic::UpdateProgress,
            Notification::UpdateDownloaded(_) => Topic::UpdateDownloaded,
            Notification::UpdateCancelled(_) => Topic::UpdateCancelled,
        }
    }

    pub fn wire_name(&self) -> String {
        match self {
            Notification::ServiceStarted { service, .. } => format!("{}Started", service),
            Notification::ServiceStopped { service, .. } => format!("{}Stopped", service),
            Notification::ServiceLog { service, .. } => format!("{}Log", service),
            Notification::UpdateAvailable(_) => "updateAvailable".to_string(),
            Notification::UpdateError(_) => "updateError".to_string(),
            Notification::UpdateNotAvailable(_) => "updateNotAvailable".to_string(),
            Notification::UpdateProgress(_) => "updateProgress".to_string(),
            Notification::UpdateDownloaded(_) => "updateDownloaded".to_string(),
            Notification::UpdateCancelled(_) => "updateCancelled".to_string(),
        }
    }

    /// Event payload as sent over IPC.
    pub fn payload(&self) -> Value {
        match self {
            Notification::ServiceStarted { pid, .. } => json!({ "pid": pid }),
            Notification::ServiceStopped { error, .. } => json!({ "error": error }),
            Notification::ServiceLog { stream, line, .. } => json!({
                "stream": stream.as_str(),
                "level": stream.level(),
                "line": line,
            }),
            Notification::UpdateAvailable(info)
            | Notification::UpdateNotAvailable(info)
            | Notification::UpdateDownloaded(info)
            | Notification::UpdateCancelled(info) => info.to_json(),
            Notification::UpdateError(message) => json!({ "message": message }),
            Notification::UpdateProgress(percent) => json!({ "percent": percent }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_follow_service_name() {
        let started = Notification::ServiceStarted {
            service: "webServer".into(),
            pid: 10,
        };
        assert_eq!(started.wire_name(), "webServerStarted");
        assert_eq!(started.topic(), Topic::ServiceStarted);
        let stopped = Notification::ServiceStopped {
            service: "webServer".into(),
            error: Some("boom".into()),
        };
        assert_eq!(stopped.wire_name(), "webServerStopped");
        assert_eq!(stopped.payload(), json!({ "error": "boom" }));
        assert_eq!(Notification::UpdateProgress(42).wire_name(), "updateProgress");
    }

    #[test]
    fn stderr_logs_are_error_level() {
        let log = Notification::ServiceLog {
            service: "webServer".into(),
            stream: StreamKind::Stderr,
            line: "warn".into(),
        };
        assert_eq!(log.payload()["level"], json!("error"));
        assert_eq!(log.payload()["stream"], json!("stderr"));
    }
}
