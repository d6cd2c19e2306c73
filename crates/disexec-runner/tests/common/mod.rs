#![allow(dead_code)]

use disexec_core::Config;
use std::fs;
use std::path::{Path, PathBuf};

/// Stand-in for the simulator. Reads `name=value` lines from the payload
/// file given as its last argument, resolves `%%Seed%%` in the scenario
/// name, writes one report into `Report.reportDir` (or the working
/// directory), announces it, and exits with `exit=` (default 0).
pub const SIMULATOR: &str = r#"#!/bin/sh
for last; do :; done
payload="$last"
value() { sed -n "s/^$1=//p" "$payload"; }
seed=$(value Seed)
scenario=$(value Scenario.name | sed "s/%%Seed%%/$seed/g")
dir=$(value Report.reportDir)
[ -n "$dir" ] || dir=.
code=$(value exit)
echo "ONE stand-in"
if [ -n "$scenario" ]; then
  mkdir -p "$dir"
  printf 'Message stats for scenario %s\ncreated: %s\ndelivery_prob: 0.5\n' "$scenario" "${seed:-0}" \
    > "$dir/${scenario}_MessageStatsReport.txt"
  echo "Running simulation '$scenario'"
fi
[ -z "$code" ] || echo "failing on purpose" >&2
exit ${code:-0}
"#;

pub fn write_simulator(dir: &Path) -> PathBuf {
    let path = dir.join("sim.sh");
    fs::write(&path, SIMULATOR).expect("write simulator");
    path
}

pub fn config(queue_url: &str, command: &str, arguments: &str) -> Config {
    Config::from_yaml_str(&format!(
        "general:\n  queue_url: \"{}\"\n  queue_name: work\n  results_queue_name: results\n\
         worker:\n  cores: 2\n  timeout_seconds: 30\n\
         task:\n  command: \"{}\"\n  arguments: \"{}\"\n",
        queue_url, command, arguments
    ))
    .expect("config")
}
