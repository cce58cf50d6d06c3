// Provides:
// - Protobuf message subset (prost)
// - Graph builder helpers
// - Dynamic uint8 weight quantization
// - Structural checker

pub mod builder;
pub mod checker;
pub mod proto;
pub mod quantize;
