pub use log::{info, warn};

pub use clap::Args;

pub type Mat = table_util::dmatrix_util::Mat;

pub use table_util::dmatrix_util::MatWithNames;
