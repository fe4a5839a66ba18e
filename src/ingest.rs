mod lanes;
mod pipeline;
mod ports;

#[cfg(test)]
mod tests;

pub use lanes::NodeLanes;
pub use pipeline::{HistoryLimits, IngestionPipeline};
pub use ports::{AlertPublisher, ReadingStore};
