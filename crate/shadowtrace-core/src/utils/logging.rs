use env_logger::Builder;
use std::io::Write;

/// Environment variable selecting the log output format.
const FORMAT_VAR: &str = "RUST_LOG_FORMAT";

/// Initialize logging with the defaults of the shadowtrace binaries.
///
/// Level defaults to WARN, except for `info_modules`, which log at
/// INFO. RUST_LOG overrides both.
///
/// Setting RUST_LOG_FORMAT to SYSTEMD prefixes each line with its
/// syslog priority instead of a timestamp.
pub fn init_with_info_modules(info_modules: Vec<&str>) {
    let mut builder = env_logger::Builder::new();

    if std::env::var(FORMAT_VAR).is_ok_and(|f| f == "SYSTEMD") {
        enable_systemd_log_format(&mut builder);
    }

    builder.filter_level(log::LevelFilter::Warn);
    for module in info_modules {
        builder.filter_module(module, log::LevelFilter::Info);
    }

    builder.parse_default_env();
    builder.init();
}

fn enable_systemd_log_format(builder: &mut Builder) {
    builder.format(|fmt, record| {
        writeln!(
            fmt,
            "<{}>{}: {}",
            syslog_priority(record.level()),
            record.target(),
            record.args()
        )
    });
}

/// Syslog priority of a log level (RFC 5424).
fn syslog_priority(level: log::Level) -> u8 {
    match level {
        log::Level::Error => 3,
        log::Level::Warn => 4,
        log::Level::Info => 5,
        log::Level::Debug | log::Level::Trace => 7,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities() {
        assert_eq!(3, syslog_priority(log::Level::Error));
        assert_eq!(4, syslog_priority(log::Level::Warn));
        assert_eq!(5, syslog_priority(log::Level::Info));
        assert_eq!(7, syslog_priority(log::Level::Debug));
        assert_eq!(7, syslog_priority(log::Level::Trace));
    }
}
