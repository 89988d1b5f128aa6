//! File adapters around the audit engine: measurement logs in, report bundles out.

pub mod chart;
pub mod checksum;
pub mod input;
pub mod report;

pub use chart::{ChartPoint, ChartSeries};
pub use input::{parse_csv, parse_json, parse_jsonl, read_measurements};
pub use report::{write_report_bundle, ReportBundle};
