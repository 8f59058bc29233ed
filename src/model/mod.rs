pub mod bench;
pub mod candle;
pub mod tick;
