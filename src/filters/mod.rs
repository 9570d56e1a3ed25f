pub mod adaptive_ekf;
pub mod quaternion;

pub use adaptive_ekf::{AdaptiveEkf, EkfSnapshot, FilterState, Innovation};
