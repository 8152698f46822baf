pub mod demux;
pub mod descriptors;
pub mod dvb_device;
pub mod filter;
pub mod output;
pub mod plan;
pub mod scan;
pub mod section;
pub mod store;
pub mod tables;
pub mod text;
pub mod tuner;
