//! Relief between stacked pools.
//!
//! An idle socket in a higher pool (say SSL) holds an active socket of the
//! pool below it (transport). When the lower pool is stalled at its limit it
//! asks the pools above to give up an idle connection.

/// A pool built on top of another pool's sockets.
pub trait HigherLayeredPool: Send + Sync {
    /// Close one idle socket, freeing its lower-layer socket. Returns whether
    /// anything was closed.
    fn close_one_idle_connection(&self) -> bool;

    fn layer_depth(&self) -> u8;

    fn pool_name(&self) -> &'static str;
}
