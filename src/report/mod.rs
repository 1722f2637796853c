//! Human-readable run output.
//!
//! ```text
//!  anomalies table ──▶ SummaryRequest ──▶ SummaryAssembler ──▶ SummaryText
//!                                              │   (generator, else template)
//!  flagged rows ─────────────────────────────▶ compliance text ◀──┘
//! ```

pub mod compliance;
pub mod summary;
