//! Intent execution: the serial queue, the hedge jobs, and pre-trade
//! slippage estimation.

pub mod engine;
pub mod queue;
pub mod slippage;
