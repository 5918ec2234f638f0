//! Report generation and the debug-output seam.
//!
//! The reporter consumes a [`RegistrySnapshot`] at guard teardown: header
//! counters first, then the full history log (chronological, without
//! symbolization), then each leaked entry with its fully symbolized call
//! stack. Everything is written through the [`DebugSink`] capability.

use colored::*;
use prettytable::{Attr, Cell, Row, Table};
use serde::Serialize;
use std::time::Duration;

use crate::record::AllocationRecord;
use crate::registry::RegistrySnapshot;
use crate::symbolize::SymbolResolver;

/// Process-wide debug-output sink: append text, no return value expected.
pub trait DebugSink: Send + Sync {
    fn write(&self, text: &str);
}

/// Default sink; reports land on stderr.
pub struct StderrSink;

impl DebugSink for StderrSink {
    fn write(&self, text: &str) {
        eprint!("{text}");
    }
}

/// Everything a [`Reporter`] needs to produce output: the final registry
/// snapshot plus session metadata.
pub struct LeakReport {
    pub snapshot: RegistrySnapshot,
    pub caller_name: String,
    pub total_elapsed: Duration,
}

/// Trait for implementing custom leak-report output.
///
/// The default reporters cover text and JSON; implement this to route
/// reports into a logging system or a test harness instead.
///
/// ```rust
/// use leaktrail::{DebugSink, LeakReport, Reporter};
/// use std::error::Error;
///
/// struct OneLiner;
///
/// impl Reporter for OneLiner {
///     fn report(&self, report: &LeakReport, sink: &dyn DebugSink) -> Result<(), Box<dyn Error>> {
///         sink.write(&format!(
///             "{} leaked of {} allocated\n",
///             report.snapshot.total_leaked, report.snapshot.total_allocated
///         ));
///         Ok(())
///     }
/// }
/// ```
pub trait Reporter {
    fn report(
        &self,
        report: &LeakReport,
        sink: &dyn DebugSink,
    ) -> Result<(), Box<dyn std::error::Error>>;
}

pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut size = bytes as f64;
    let mut unit_idx = 0;
    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[unit_idx])
    } else {
        format!("{:.1} {}", size, UNITS[unit_idx])
    }
}

fn site_label(record: &AllocationRecord) -> String {
    match record.site {
        Some(site) => format!("category {}, {}:{}", site.category, site.file, site.line),
        None => String::new(),
    }
}

/// Human-readable report: counters, history table, symbolized leaks.
pub struct TextReporter;

impl Reporter for TextReporter {
    fn report(
        &self,
        report: &LeakReport,
        sink: &dyn DebugSink,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let snap = &report.snapshot;

        if snap.live.is_empty() {
            sink.write(&format!(
                "\n{} No leaked allocations from {} ({} allocated in total, total time: {:.2?})\n",
                "[leaktrail]".blue().bold(),
                report.caller_name.yellow().bold(),
                format_bytes(snap.total_allocated),
                report.total_elapsed,
            ));
            return Ok(());
        }

        sink.write(&format!(
            "\n{} Leak report for {} (total time: {:.2?})\n",
            "[leaktrail]".blue().bold(),
            report.caller_name.yellow().bold(),
            report.total_elapsed,
        ));
        sink.write(&format!(
            "Allocated: {} ({} bytes cumulative)\n",
            format_bytes(snap.total_allocated),
            snap.total_allocated,
        ));
        sink.write(&format!(
            "Leaked:    {} of {} ({} of {} bytes) across {} allocation(s)\n\n",
            format_bytes(snap.total_leaked).red().bold(),
            format_bytes(snap.total_allocated),
            snap.total_leaked,
            snap.total_allocated,
            snap.live.len(),
        ));

        sink.write(&format!("All allocations ({}):\n", snap.history.len()));
        sink.write(&history_table(snap).to_string());
        sink.write("\n");

        // Symbolization happens only here, once per leaked frame.
        let resolver = SymbolResolver::new();
        sink.write(&format!("Leaked allocations ({}):\n", snap.live.len()));
        for record in snap.live.iter() {
            let site = site_label(record);
            if site.is_empty() {
                sink.write(&format!("{:#x} ({} bytes)\n", record.address, record.size));
            } else {
                sink.write(&format!(
                    "{:#x} ({} bytes) [{}]\n",
                    record.address, record.size, site
                ));
            }
            for &frame in record.stack() {
                sink.write(&format!("    {}\n", resolver.resolve(frame)));
            }
            sink.write("\n");
        }

        Ok(())
    }
}

fn history_table(snap: &RegistrySnapshot) -> Table {
    let use_colors = std::env::var("NO_COLOR").is_err();

    let mut table = Table::new();
    let header: Vec<Cell> = ["#", "Address", "Size", "Site"]
        .iter()
        .map(|name| {
            if use_colors {
                Cell::new(name)
                    .with_style(Attr::Bold)
                    .with_style(Attr::ForegroundColor(prettytable::color::CYAN))
            } else {
                Cell::new(name).with_style(Attr::Bold)
            }
        })
        .collect();
    table.add_row(Row::new(header));

    for (index, record) in snap.history.iter().enumerate() {
        let site = site_label(record);
        table.add_row(Row::new(vec![
            Cell::new(&index.to_string()),
            Cell::new(&format!("{:#x}", record.address)),
            Cell::new(&record.size.to_string()),
            Cell::new(if site.is_empty() { "-" } else { site.as_str() }),
        ]));
    }

    table
}

#[derive(Serialize, Debug, Clone)]
struct SiteJson {
    category: u32,
    file: String,
    line: u32,
}

#[derive(Serialize, Debug, Clone)]
struct AllocationJson {
    address: String,
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    site: Option<SiteJson>,
}

#[derive(Serialize, Debug, Clone)]
struct LeakJson {
    #[serde(flatten)]
    allocation: AllocationJson,
    call_stack: Vec<String>,
}

#[derive(Serialize, Debug, Clone)]
struct ReportJson {
    caller_name: String,
    total_elapsed_ns: u64,
    total_allocated_bytes: u64,
    total_leaked_bytes: u64,
    history: Vec<AllocationJson>,
    leaks: Vec<LeakJson>,
}

impl From<&AllocationRecord> for AllocationJson {
    fn from(record: &AllocationRecord) -> Self {
        Self {
            address: format!("{:#x}", record.address),
            size: record.size as u64,
            site: record.site.map(|site| SiteJson {
                category: site.category,
                file: site.file.to_string(),
                line: site.line,
            }),
        }
    }
}

impl From<&LeakReport> for ReportJson {
    fn from(report: &LeakReport) -> Self {
        let snap = &report.snapshot;
        let resolver = SymbolResolver::new();

        Self {
            caller_name: report.caller_name.clone(),
            total_elapsed_ns: report.total_elapsed.as_nanos() as u64,
            total_allocated_bytes: snap.total_allocated,
            total_leaked_bytes: snap.total_leaked,
            history: snap.history.iter().map(AllocationJson::from).collect(),
            leaks: snap
                .live
                .iter()
                .map(|record| LeakJson {
                    allocation: AllocationJson::from(record),
                    call_stack: record
                        .stack()
                        .iter()
                        .map(|&frame| resolver.resolve(frame))
                        .collect(),
                })
                .collect(),
        }
    }
}

/// Machine-readable report on a single line.
pub struct JsonReporter;

impl Reporter for JsonReporter {
    fn report(
        &self,
        report: &LeakReport,
        sink: &dyn DebugSink,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let json = ReportJson::from(report);
        sink.write(&serde_json::to_string(&json)?);
        sink.write("\n");
        Ok(())
    }
}

/// Pretty-printed variant of [`JsonReporter`].
pub struct JsonPrettyReporter;

impl Reporter for JsonPrettyReporter {
    fn report(
        &self,
        report: &LeakReport,
        sink: &dyn DebugSink,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let json = ReportJson::from(report);
        sink.write(&serde_json::to_string_pretty(&json)?);
        sink.write("\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AllocationRegistry;
    use serde_json::Value;
    use std::sync::Mutex;

    struct BufferSink(Mutex<String>);

    impl BufferSink {
        fn new() -> Self {
            Self(Mutex::new(String::new()))
        }

        fn contents(&self) -> String {
            self.0.lock().unwrap().clone()
        }
    }

    impl DebugSink for BufferSink {
        fn write(&self, text: &str) {
            self.0.lock().unwrap().push_str(text);
        }
    }

    fn scenario_report() -> LeakReport {
        let reg = AllocationRegistry::new();
        reg.record(0xa000, 16);
        reg.record(0xb000, 32);
        reg.record_with_site(0xc000, 64, 1, "x.c", 42);
        reg.release(0xb000);

        LeakReport {
            snapshot: reg.snapshot(),
            caller_name: "scenario::main".to_string(),
            total_elapsed: Duration::from_millis(5),
        }
    }

    #[test]
    fn text_report_contains_counters_and_leaks() {
        let report = scenario_report();
        let sink = BufferSink::new();
        TextReporter.report(&report, &sink).unwrap();

        let text = sink.contents();
        assert!(text.contains("112 bytes cumulative"));
        assert!(text.contains("80 of 112 bytes"));
        assert!(text.contains("0xa000 (16 bytes)"));
        assert!(text.contains("0xc000 (64 bytes) [category 1, x.c:42]"));
        // The freed block shows up in the history, not among the leaks.
        assert!(text.contains("0xb000"));
        assert!(!text.contains("0xb000 (32 bytes)\n"));
    }

    #[test]
    fn text_report_without_leaks_is_a_single_message() {
        let reg = AllocationRegistry::new();
        reg.record(0x1000, 8);
        reg.release(0x1000);
        let report = LeakReport {
            snapshot: reg.snapshot(),
            caller_name: "clean::main".to_string(),
            total_elapsed: Duration::from_millis(1),
        };

        let sink = BufferSink::new();
        TextReporter.report(&report, &sink).unwrap();

        let text = sink.contents();
        assert!(text.contains("No leaked allocations"));
        assert!(!text.contains("Leaked allocations"));
    }

    #[test]
    fn json_report_structure() {
        let report = scenario_report();
        let sink = BufferSink::new();
        JsonReporter.report(&report, &sink).unwrap();

        let value: Value = serde_json::from_str(&sink.contents()).unwrap();
        assert_eq!(value["caller_name"], "scenario::main");
        assert_eq!(value["total_allocated_bytes"], 112);
        assert_eq!(value["total_leaked_bytes"], 80);
        assert_eq!(value["history"].as_array().unwrap().len(), 3);

        let leaks = value["leaks"].as_array().unwrap();
        assert_eq!(leaks.len(), 2);
        assert_eq!(leaks[0]["address"], "0xa000");
        assert_eq!(leaks[0]["size"], 16);
        assert!(leaks[0].get("site").is_none());
        assert_eq!(leaks[1]["site"]["category"], 1);
        assert_eq!(leaks[1]["site"]["file"], "x.c");
        assert_eq!(leaks[1]["site"]["line"], 42);
        assert!(leaks[1]["call_stack"].is_array());
    }

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
