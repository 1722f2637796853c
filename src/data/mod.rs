//! Data layer: core types, loading, and column resolution.
//!
//! Architecture:
//! ```text
//!  .csv / .tsv / .parquet
//!        │
//!        ▼
//!   ┌──────────┐
//!   │  loader   │  decode + parse file → Table
//!   └──────────┘
//!        │
//!        ▼
//!   ┌──────────┐
//!   │  Table    │  columns, Vec<Vec<Value>>
//!   └──────────┘
//!        │
//!        ▼
//!   ┌──────────┐
//!   │  schema   │  locate reporting year / emission value / facility columns
//!   └──────────┘
//! ```

pub mod loader;
pub mod model;
pub mod schema;
