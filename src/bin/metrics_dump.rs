//! Metrics Dump
//!
//! Prints the aggregated value of every metric found in a store directory.
//!
//! Usage:
//!   metrics-dump [DIR] [--aggregation sum|max|min] [--json]
//!
//! DIR defaults to `MMAP_METRICS_DIR`. Max and min are applied as gauge
//! aggregations; sum is the default. Set `RUST_LOG=debug` to see which
//! files are read.

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;

use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use mmap_metrics::{
    Aggregation, DataStore, MetricSettings, MetricStore, MetricType, MmapStore, StoreConfig,
};

struct Args {
    dir: Option<PathBuf>,
    aggregation: Aggregation,
    json: bool,
}

impl Args {
    fn parse() -> Result<Self, Box<dyn std::error::Error>> {
        let mut args = Args {
            dir: None,
            aggregation: Aggregation::Sum,
            json: false,
        };
        let mut iter = env::args().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--json" => args.json = true,
                "--aggregation" => {
                    let mode = iter.next().ok_or("--aggregation needs a value")?;
                    args.aggregation = mode.parse()?;
                }
                flag if flag.starts_with("--") => {
                    return Err(format!("unknown flag: {}", flag).into());
                }
                dir => args.dir = Some(PathBuf::from(dir)),
            }
        }
        Ok(args)
    }
}

/// Logs go to stderr, filtered by `RUST_LOG`; JSON lines when
/// `MMAP_METRICS_LOG_JSON` is set.
fn init_logging() {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr);
    if env::var_os("MMAP_METRICS_LOG_JSON").is_some() {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let args = Args::parse()?;
    let mut config = StoreConfig::from_env()?;
    if let Some(dir) = args.dir {
        config.dir = dir;
    }

    let metric_type = match args.aggregation {
        Aggregation::Sum => MetricType::Counter,
        Aggregation::Max | Aggregation::Min => MetricType::Gauge,
    };
    let settings = MetricSettings::with_aggregation(args.aggregation);

    let store = MmapStore::existing(config)?;
    info!(dir = %store.config().dir.display(), aggregation = %args.aggregation, "dumping metrics");

    let mut dump: BTreeMap<String, Vec<(String, f64)>> = BTreeMap::new();
    for name in store.metric_names()? {
        let metric = store.for_metric(&name, metric_type, &settings)?;
        let values = metric.all_values()?;
        debug!(metric = %name, series = values.len(), "read metric");
        dump.insert(
            name,
            values
                .into_iter()
                .map(|(labels, value)| (labels.to_string(), value))
                .collect(),
        );
    }

    if args.json {
        let json: BTreeMap<&str, BTreeMap<&str, f64>> = dump
            .iter()
            .map(|(name, series)| {
                let series = series.iter().map(|(l, v)| (l.as_str(), *v)).collect();
                (name.as_str(), series)
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else {
        for (name, series) in &dump {
            for (labels, value) in series {
                println!("{}{} {}", name, labels, value);
            }
        }
    }

    Ok(())
}
