pub mod aggregator;

pub use aggregator::HttpAggregatorClient;
