//! The bundled web server, the one concrete `Service` today.
//!
//! The server is a standalone Next.js build. It is configured entirely through
//! environment variables taken from `config.server` at every start, and it
//! prints `✓ Ready in <n>ms` once it accepts connections. That line is the
//! success marker; changing it on either side breaks startup detection.

use crate::config::ServerConfig;
use crate::output::{HealthClassifier, MarkerClassifier};
use crate::process::ProcessSpec;
use crate::runner::Service;

/// Logical name of the web server.
pub const WEB_SERVER: &str = "webServer";
/// Line printed by the web server once it is listening.
pub const READY_MARKER: &str = "✓ Ready in";
/// Command used when none is configured: the standalone server entry point.
pub const DEFAULT_COMMAND: &str = "node server.js";

pub struct WebService {
    command: ProcessSpec,
    classifier: Box<dyn HealthClassifier>,
}

impl WebService {
    pub fn new(command: ProcessSpec) -> Self {
        Self {
            command,
            classifier: Box::new(MarkerClassifier::new(READY_MARKER)),
        }
    }

    pub fn with_classifier(mut self, classifier: impl HealthClassifier + 'static) -> Self {
        self.classifier = Box::new(classifier);
        self
    }
}

impl Service for WebService {
    fn name(&self) -> &str {
        WEB_SERVER
    }

    fn command(&self, server: &ServerConfig) -> ProcessSpec {
        let mut spec = self.command.clone();
        let env = [
            ("PORT", server.port.to_string()),
            ("HOSTNAME", server.bind_hostname.clone()),
            ("GAUZY_API_SERVER_URL", server.upstream_api_url.clone()),
            (
                "NEXT_PUBLIC_GAUZY_API_SERVER_URL",
                server.public_upstream_api_url.clone(),
            ),
            ("NODE_ENV", "production".to_string()),
        ];
        for (key, value) in env {
            spec.env.insert(key.to_string(), value);
        }
        spec
    }

    fn classifier(&self) -> &dyn HealthClassifier {
        self.classifier.as_ref()
    }
}

/// Address windows load the web app from.
pub fn local_url(server: &ServerConfig) -> String {
    let host = match server.bind_hostname.as_str() {
        "" | "0.0.0.0" | "::" => "localhost",
        host => host,
    };
    format!("http://{}:{}", host, server.port)
}
