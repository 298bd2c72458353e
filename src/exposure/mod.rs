//! Night-time exposure control: shutter table, brightness measurement,
//! persisted index and the bracketing search that ties them together.

mod meter;
mod search;
mod store;
mod table;

pub use meter::{mean_luma, BrightnessMeter, LumaMeter, MeterError};
pub use search::{
    pick_closest, Attempt, ExposureSearch, SearchResult, SearchSettings, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_SETTLE,
};
pub use store::{ExposureStore, StoreError, DEFAULT_STATE_FILE};
pub use table::{BrightnessTarget, ExposureError, ShutterTable, DEFAULT_SHUTTER_SPEEDS};
