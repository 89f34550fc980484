use std::path::PathBuf;

/// Global file-rotation defaults, overridable with `log size:BYTES count:N`.
pub const DEFAULT_ROTATE_SIZE: u64 = 200_000;
pub const DEFAULT_ROTATE_COUNT: u32 = 5;

/// Where a spawned child's stdout/stderr go.
///
/// Rotation of file sinks is handled by an external rotator; the
/// size/count policy only rides along on the record. Syslog transport is
/// likewise external, so a syslog sink parses and compares but the child's
/// stdio falls back to /dev/null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    /// Inherit the supervisor's stdio untouched.
    Off,
    /// Discard output.
    Null,
    /// Write to the system console.
    Console,
    File {
        path: PathBuf,
        rotate_size: u64,
        rotate_count: u32,
    },
    Syslog {
        facility: String,
        level: String,
        tag: String,
    },
}

impl LogSink {
    /// Parse a `log` / `log:SPEC` service-line option.
    ///
    /// Recognized forms, following the original grammar:
    ///   `log`                  syslog with daemon.info and the service name
    ///   `log:null`, `log:off`, `log:console`
    ///   `log:/path/to/file`    append to file, global rotation policy
    ///   `log:prio:facility.level[,tag:ident]`
    pub fn parse(spec: Option<&str>, name: &str, rotate_size: u64, rotate_count: u32) -> LogSink {
        let spec = match spec {
            None => {
                return LogSink::Syslog {
                    facility: "daemon".to_string(),
                    level: "info".to_string(),
                    tag: name.to_string(),
                }
            }
            Some(s) => s,
        };

        match spec {
            "null" => return LogSink::Null,
            "off" => return LogSink::Off,
            "console" => return LogSink::Console,
            _ => {}
        }

        if spec.starts_with('/') {
            return LogSink::File {
                path: PathBuf::from(spec),
                rotate_size,
                rotate_count,
            };
        }

        let mut facility = "daemon".to_string();
        let mut level = "info".to_string();
        let mut tag = name.to_string();
        for part in spec.split(',') {
            if let Some(prio) = part.strip_prefix("prio:") {
                match prio.split_once('.') {
                    Some((f, l)) => {
                        facility = f.to_string();
                        level = l.to_string();
                    }
                    None => level = prio.to_string(),
                }
            } else if let Some(ident) = part.strip_prefix("tag:") {
                tag = ident.to_string();
            }
        }

        LogSink::Syslog {
            facility,
            level,
            tag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_log_is_syslog() {
        let sink = LogSink::parse(None, "ntpd", DEFAULT_ROTATE_SIZE, DEFAULT_ROTATE_COUNT);
        assert_eq!(
            sink,
            LogSink::Syslog {
                facility: "daemon".to_string(),
                level: "info".to_string(),
                tag: "ntpd".to_string(),
            }
        );
    }

    #[test]
    fn test_file_sink_carries_rotation_policy() {
        let sink = LogSink::parse(Some("/var/log/ntpd.log"), "ntpd", 1024, 3);
        assert_eq!(
            sink,
            LogSink::File {
                path: PathBuf::from("/var/log/ntpd.log"),
                rotate_size: 1024,
                rotate_count: 3,
            }
        );
    }

    #[test]
    fn test_keyword_sinks() {
        let size = DEFAULT_ROTATE_SIZE;
        let count = DEFAULT_ROTATE_COUNT;
        assert_eq!(LogSink::parse(Some("null"), "x", size, count), LogSink::Null);
        assert_eq!(LogSink::parse(Some("off"), "x", size, count), LogSink::Off);
        assert_eq!(
            LogSink::parse(Some("console"), "x", size, count),
            LogSink::Console
        );
    }

    #[test]
    fn test_syslog_prio_and_tag() {
        let sink = LogSink::parse(
            Some("prio:local0.warning,tag:chrony"),
            "chronyd",
            DEFAULT_ROTATE_SIZE,
            DEFAULT_ROTATE_COUNT,
        );
        assert_eq!(
            sink,
            LogSink::Syslog {
                facility: "local0".to_string(),
                level: "warning".to_string(),
                tag: "chrony".to_string(),
            }
        );
    }
}
