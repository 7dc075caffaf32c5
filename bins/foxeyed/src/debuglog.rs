//! Log setup: stderr output scaled by `-d`, and the `foxeye.debug` file
//! when `-D` is on. Debug-level lines in the file carry a realtime
//! `[sec.nsec]` stamp, everything else gets the `::` prefix.

use std::fmt;
use std::fs::OpenOptions;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::Level;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

pub const DEBUG_LOG_NAME: &str = "foxeye.debug";

static LOGFILE: Mutex<Option<std::fs::File>> = Mutex::new(None);

struct DebugFormat;

impl<S, N> FormatEvent<S, N> for DebugFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let level = *event.metadata().level();
        if level == Level::DEBUG || level == Level::TRACE {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            write!(writer, "[{}.{:09}]", now.as_secs(), now.subsec_nanos())?;
        } else {
            write!(writer, "::")?;
        }
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

struct FileWriter;

impl std::io::Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        use std::io::Write as _;
        let mut guard = LOGFILE.lock().unwrap();
        match guard.as_mut() {
            Some(f) => {
                let n = f.write(buf)?;
                f.flush()?;
                Ok(n)
            }
            None => Ok(buf.len()),
        }
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn level_for(debug: u8) -> Level {
    match debug {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Install the subscriber once at startup.
pub fn init(debug: u8, debug_log: bool, console: bool) {
    if debug_log {
        reopen(true);
        let sub = tracing_subscriber::fmt()
            .event_format(DebugFormat)
            .with_writer(|| FileWriter)
            .with_max_level(Level::TRACE)
            .finish();
        let _ = tracing::subscriber::set_global_default(sub);
    } else if console {
        let sub = tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_max_level(level_for(debug))
            .finish();
        let _ = tracing::subscriber::set_global_default(sub);
    }
    // detached without -D: logging flows only through LOG interfaces
}

/// (Re)open `foxeye.debug` in the current directory; SIGHUP calls this to
/// restart the file.
pub fn reopen(enabled: bool) {
    let mut guard = LOGFILE.lock().unwrap();
    *guard = if enabled {
        OpenOptions::new().create(true).append(true).open(DEBUG_LOG_NAME).ok()
    } else {
        None
    };
}
