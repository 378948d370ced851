pub mod decoder;
pub mod radio;
pub mod scanner;

pub use decoder::{decode, DataFormat, DecodeError};
pub use radio::{Advertisement, BluerRadio, Radio, ScanStartError};
pub use scanner::{CycleSummary, ScanLoop, ScanLoopError, ScanSettings};
