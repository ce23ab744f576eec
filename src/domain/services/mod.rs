mod server_finder;

pub use server_finder::{parse_metric_value, Comparator, MetricParseError, MetricsBasedServerFinder};
