//! Forwards file: one forward per line.
//!
//! ```text
//! -8080:example.com:80      local-only listener on port 8080
//! *2222:10.0.0.5:22         listener on every interface
//! ```
//!
//! Lines that do not split into exactly three fields, or whose first field is
//! empty, are skipped when loading.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Which interfaces a forward's listener binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindScope {
    /// Loopback only (`-` prefix).
    Local,
    /// Every interface (`*` prefix).
    Any,
}

impl BindScope {
    const fn marker(self) -> char {
        match self {
            Self::Local => '-',
            Self::Any => '*',
        }
    }
}

/// One persisted forward definition, still unresolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub scope: BindScope,
    pub source_port: u16,
    pub destination_host: String,
    pub destination_port: u16,
}

impl ForwardSpec {
    /// Concrete host the listener should bind for this forward's scope.
    pub const fn bind_host(&self) -> &'static str {
        match self.scope {
            BindScope::Local => "127.0.0.1",
            BindScope::Any => "0.0.0.0",
        }
    }
}

impl fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}:{}:{}",
            self.scope.marker(),
            self.source_port,
            self.destination_host,
            self.destination_port
        )
    }
}

impl FromStr for ForwardSpec {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::ForwardSpec {
            line: line.to_string(),
            reason: reason.to_string(),
        };

        let fields: Vec<&str> = line.trim().split(':').collect();
        let [source, host, port] = fields.as_slice() else {
            return Err(invalid("expected <scope><port>:<host>:<port>"));
        };
        let mut source_chars = source.chars();
        let Some(marker) = source_chars.next() else {
            return Err(invalid("missing source port"));
        };
        let scope = if marker == '-' {
            BindScope::Local
        } else {
            BindScope::Any
        };
        if host.is_empty() {
            return Err(invalid("missing destination host"));
        }

        Ok(Self {
            scope,
            source_port: source_chars
                .as_str()
                .parse()
                .map_err(|_| invalid("source port is not a number"))?,
            destination_host: (*host).to_string(),
            destination_port: port
                .parse()
                .map_err(|_| invalid("destination port is not a number"))?,
        })
    }
}

/// Parse every well-formed line, skipping (and logging) the rest.
pub fn parse_forwards(content: &str) -> Vec<ForwardSpec> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match line.parse() {
            Ok(spec) => Some(spec),
            Err(e) => {
                warn!(error = %e, "Skipping forward definition");
                None
            }
        })
        .collect()
}

/// Render forwards in file format, one per line.
pub fn format_forwards(forwards: &[ForwardSpec]) -> String {
    forwards.iter().map(|spec| format!("{spec}\n")).collect()
}

/// Load forwards from a file.
pub fn load_forwards(path: &Path) -> Result<Vec<ForwardSpec>> {
    let content = std::fs::read_to_string(path)?;
    let forwards = parse_forwards(&content);
    debug!(path = %path.display(), count = forwards.len(), "Loaded forwards");
    Ok(forwards)
}

/// Write forwards to a file, creating parent directories.
pub fn save_forwards(path: &Path, forwards: &[ForwardSpec]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format_forwards(forwards))?;
    Ok(())
}
