use colored::*;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

/// Operator-facing tracing formatter.
///
/// Colors each line by severity and prefixes the bracketed target for the
/// two targets a referee operator actually watches: `MPS` (station events
/// and failures) and `FACT` (facts asserted into the rule engine). Timestamps
/// and metadata stay in the detailed log; this surface stays clean.
pub struct OperatorFormatter;

impl<S, N> FormatEvent<S, N> for OperatorFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // Buffer the fields so the color applies to the whole line.
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let target = event.metadata().target();
        let line = match target {
            "MPS" | "FACT" => format!("[{target}] {buffer}"),
            _ => buffer,
        };

        let colored_line = match *event.metadata().level() {
            Level::ERROR => line.red(),
            Level::WARN => line.yellow(),
            Level::INFO => line.white(),
            Level::DEBUG => line.blue(),
            Level::TRACE => line.purple(),
        };

        writeln!(writer, "{colored_line}")
    }
}
