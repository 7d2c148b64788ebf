//! `gsmctl` querying and output parsing
//!
//! `gsmctl` prints one line per requested flag, in request order. The
//! `--serving` line carries the modem's raw `AT+QENG` serving cell report,
//! whose layout depends on the radio access technology.

use crate::error::{MonitorError, Result};
use crate::models::RouterReading;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Numeric,
    Text,
}

use FieldKind::{Numeric, Text};

/// Requested fields, in the order gsmctl reports them
const FIELDS: &[(&str, FieldKind)] = &[
    ("connstate", Text),
    ("netstate", Text),
    ("imei", Text),
    ("iccid", Text),
    ("model", Text),
    ("manuf", Text),
    ("serial", Text),
    ("revision", Text),
    ("imsi", Text),
    ("simstate", Text),
    ("pinstate", Text),
    ("signal", Numeric),
    ("rscp", Numeric),
    ("ecio", Numeric),
    ("rsrp", Numeric),
    ("sinr", Numeric),
    ("rsrq", Numeric),
    ("cellid", Numeric),
    ("operator", Text),
    ("opernum", Numeric),
    ("conntype", Text),
    ("temp", Numeric),
    ("network", Text),
    ("serving", Text),
];

/// Metrics the serving cell report may supply
const SERVING_METRICS: &[&str] = &[
    "mcc",
    "mnc",
    "cellid",
    "rsrp",
    "rsrq",
    "sinr",
    "rscp",
    "ecio",
    "freq_band_ind",
];

const GSM_LAYOUT: &[&str] = &[
    "state", "mode", "mcc", "mnc", "lac", "cellid", "bsic", "arfcn", "band", "rxlev", "txp",
    "rla", "drx", "c1", "c2", "gprs", "tch", "ts", "ta", "maio", "hsn", "rxlevsub", "rxlevfull",
    "rxqualsub", "rxqualfull", "voicecodec",
];

const WCDMA_LAYOUT: &[&str] = &[
    "state", "mode", "mcc", "mnc", "lac", "cellid", "uarfcn", "psc", "rac", "rscp", "ecio",
    "phych", "sf", "slot", "speech_code", "comMod",
];

const LTE_LAYOUT: &[&str] = &[
    "state",
    "mode",
    "is_tdd",
    "mcc",
    "mnc",
    "cellid",
    "pcid",
    "earfcn",
    "freq_band_ind",
    "ul_bandwidth",
    "dll_bandwidth",
    "tac",
    "rsrp",
    "rsrq",
    "rssi",
    "sinr",
    "srxlev",
];

const TDSCDMA_LAYOUT: &[&str] = &[
    "state", "mode", "mcc", "mnc", "lac", "cellid", "pfreq", "rssi", "rscp", "ecio",
];

/// Command line that queries every field
pub fn command() -> String {
    let flags: Vec<String> = FIELDS.iter().map(|(name, _)| format!("--{}", name)).collect();
    format!("gsmctl {}", flags.join(" "))
}

/// Parse gsmctl stdout into metrics and attributes
pub fn parse_output(stdout: &str) -> Result<RouterReading> {
    let lines: Vec<&str> = stdout.lines().map(str::trim).collect();
    if lines.len() < FIELDS.len() {
        return Err(MonitorError::Read(format!(
            "gsmctl returned {} lines, expected {}",
            lines.len(),
            FIELDS.len()
        )));
    }

    let mut reading = RouterReading::default();

    for ((name, kind), value) in FIELDS.iter().zip(lines.iter()) {
        if value.is_empty() {
            continue;
        }
        match kind {
            Numeric => match parse_number(value) {
                Some(v) => {
                    reading.metrics.insert(name.to_string(), v);
                }
                None => {
                    tracing::debug!("[Gsmctl] Skipping non-numeric {}: {:?}", name, value);
                }
            },
            Text => {
                reading.attributes.insert(name.to_string(), value.to_string());
            }
        }
    }

    if let Some(serving) = reading.attributes.get("serving").cloned() {
        for (name, value) in parse_serving(&serving) {
            reading.metrics.insert(name, value);
        }
    }

    Ok(reading)
}

/// Decode a `+QENG: "servingcell",...` line into numeric metrics
pub fn parse_serving(line: &str) -> Vec<(String, f64)> {
    let Some((_, body)) = line.split_once(':') else {
        return Vec::new();
    };

    let values: Vec<Option<&str>> = body
        .trim()
        .split(',')
        .map(|v| v.trim().trim_matches('"'))
        .map(|v| if v == "-" { None } else { Some(v) })
        .collect();

    let Some(Some(mode)) = values.get(2) else {
        return Vec::new();
    };

    let layout = match *mode {
        "GSM" => GSM_LAYOUT,
        "WCDMA" => WCDMA_LAYOUT,
        "LTE" => LTE_LAYOUT,
        "TDSCDMA" => TDSCDMA_LAYOUT,
        _ => return Vec::new(),
    };

    layout
        .iter()
        .zip(values.iter().skip(1))
        .filter(|(name, _)| SERVING_METRICS.contains(name))
        .filter_map(|(name, value)| {
            let value = (*value)?;
            let parsed = if *name == "cellid" {
                i64::from_str_radix(value, 16).ok().map(|v| v as f64)
            } else {
                parse_number(value)
            };
            parsed.map(|v| (name.to_string(), v))
        })
        .collect()
}

fn parse_number(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}
