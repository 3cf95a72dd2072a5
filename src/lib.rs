//! riskflow: market-risk indicator ingestion and signal scoring

pub mod pipeline;
