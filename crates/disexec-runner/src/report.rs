use disexec_core::config::DEFAULT_REPORT_SUFFIX;
use disexec_core::{typed_value, Error, Result, ResultRecord, ID_FIELD};
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

/// Turns one report file into a metrics mapping.
pub trait ReportParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<ResultRecord>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserKind {
    MessageStatsReport,
    MessageStatsReportFilename,
}

impl ParserKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "message_stats_report" => Ok(Self::MessageStatsReport),
            "message_stats_report_filename" => Ok(Self::MessageStatsReportFilename),
            other => Err(Error::Configuration(format!(
                "unknown report parser '{}': expected message_stats_report or message_stats_report_filename",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageStatsReport => "message_stats_report",
            Self::MessageStatsReportFilename => "message_stats_report_filename",
        }
    }

    pub fn build(self, report_suffix: &str) -> Box<dyn ReportParser> {
        match self {
            Self::MessageStatsReport => Box::new(MessageStatsReportParser),
            Self::MessageStatsReportFilename => Box::new(FilenameAwareParser {
                suffix: report_suffix.to_string(),
            }),
        }
    }
}

fn scenario_line() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^.*scenario (.*)$").expect("static scenario pattern"))
}

/// Reads a `MessageStatsReport`: a `... scenario <name>` title line followed
/// by `metric: value` lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageStatsReportParser;

impl ReportParser for MessageStatsReportParser {
    fn parse(&self, path: &Path) -> Result<ResultRecord> {
        if !path.exists() {
            return Err(Error::FileNotFound(path.to_path_buf()));
        }
        let text = fs::read_to_string(path)?;
        let mut lines = text.lines();
        let title = lines.next().unwrap_or_default().trim_end();
        let scenario = scenario_line()
            .captures(title)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .ok_or_else(|| Error::MalformedReport {
                path: path.to_path_buf(),
                reason: format!("first line does not name a scenario: '{}'", title),
            })?;

        let mut record = ResultRecord::new();
        record.insert(ID_FIELD, scenario);
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            record.insert(name, typed_value(value));
        }
        Ok(record)
    }
}

/// Same as [`MessageStatsReportParser`], plus settings decoded from the
/// report file name.
///
/// Grammar of the name stem (the part before the report suffix), tokens
/// separated by `_`: `<mobility>_<router>` followed by any of `n<nodes>`,
/// `ttl<minutes>`, `seed<value>`, `buf<size>`, `int<interval>`,
/// `w<weight>` in any order. Unrecognised tokens are ignored.
#[derive(Debug, Clone)]
pub struct FilenameAwareParser {
    suffix: String,
}

impl Default for FilenameAwareParser {
    fn default() -> Self {
        Self {
            suffix: DEFAULT_REPORT_SUFFIX.to_string(),
        }
    }
}

const FILENAME_TOKENS: &[(&str, &str)] = &[
    ("seed", "seed"),
    ("ttl", "ttl"),
    ("buf", "buffer"),
    ("int", "interval"),
    ("n", "nodes"),
    ("w", "weight"),
];

pub fn decompose_file_name(stem: &str) -> Vec<(&'static str, String)> {
    let mut fields = Vec::new();
    let mut tokens = stem.split('_').filter(|t| !t.is_empty());
    if let Some(mobility) = tokens.next() {
        fields.push(("mobility", mobility.to_string()));
    }
    if let Some(router) = tokens.next() {
        fields.push(("router", router.to_string()));
    }
    for token in tokens {
        for (prefix, field) in FILENAME_TOKENS {
            if let Some(value) = token.strip_prefix(prefix) {
                if !value.is_empty() && value.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '+') {
                    fields.push((*field, value.to_string()));
                    break;
                }
            }
        }
    }
    fields
}

impl ReportParser for FilenameAwareParser {
    fn parse(&self, path: &Path) -> Result<ResultRecord> {
        let mut record = MessageStatsReportParser.parse(path)?;
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let stem = name
            .strip_suffix(self.suffix.as_str())
            .or_else(|| name.rsplit_once('.').map(|(s, _)| s))
            .unwrap_or(name);
        for (field, value) in decompose_file_name(stem) {
            record.insert(field, typed_value(&value));
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const REPORT: &str = "Message stats for scenario Random_Epidemic_n40_ttl300_seed7_buf5M_int25-35_w0.5\n\
sim_time: 43200.0000\n\
created: 1402\n\
delivery_prob: 0.4522\n\
latency_med: NaN\n\
\n";

    fn write_report(dir: &Path, name: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, REPORT).expect("write report");
        path
    }

    #[test]
    fn parses_scenario_and_typed_metrics() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_report(dir.path(), "r_MessageStatsReport.txt");
        let record = MessageStatsReportParser.parse(&path).expect("parse");
        assert_eq!(
            record.id(),
            Some("Random_Epidemic_n40_ttl300_seed7_buf5M_int25-35_w0.5")
        );
        assert_eq!(record.get("sim_time"), Some(&json!(43200.0)));
        assert_eq!(record.get("created"), Some(&json!(1402)));
        assert_eq!(record.get("delivery_prob"), Some(&json!(0.4522)));
        assert_eq!(record.get("latency_med"), Some(&json!("NaN")));
    }

    #[test]
    fn missing_report_is_file_not_found() {
        let err = MessageStatsReportParser
            .parse(Path::new("/nonexistent/report.txt"))
            .expect_err("missing");
        assert!(matches!(err, Error::FileNotFound(_)));
    }

    #[test]
    fn title_without_scenario_is_malformed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.txt");
        fs::write(&path, "created: 3\n").expect("write");
        let err = MessageStatsReportParser.parse(&path).expect_err("malformed");
        assert!(matches!(err, Error::MalformedReport { .. }));
    }

    #[test]
    fn filename_tokens_are_decomposed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_report(
            dir.path(),
            "Random_Epidemic_n40_ttl300_seed7_buf5M_int25-35_w0.5_MessageStatsReport.txt",
        );
        let record = ParserKind::MessageStatsReportFilename
            .build(DEFAULT_REPORT_SUFFIX)
            .parse(&path)
            .expect("parse");
        assert_eq!(record.get("mobility"), Some(&json!("Random")));
        assert_eq!(record.get("router"), Some(&json!("Epidemic")));
        assert_eq!(record.get("nodes"), Some(&json!(40)));
        assert_eq!(record.get("ttl"), Some(&json!(300)));
        assert_eq!(record.get("seed"), Some(&json!(7)));
        assert_eq!(record.get("buffer"), Some(&json!("5M")));
        assert_eq!(record.get("interval"), Some(&json!("25-35")));
        assert_eq!(record.get("weight"), Some(&json!(0.5)));
        assert_eq!(record.get("created"), Some(&json!(1402)));
    }

    #[test]
    fn parser_registry_is_closed() {
        assert_eq!(
            ParserKind::from_name("message_stats_report").unwrap(),
            ParserKind::MessageStatsReport
        );
        assert!(matches!(
            ParserKind::from_name("MessageStatsReportParser"),
            Err(Error::Configuration(_))
        ));
    }
}
