use std::sync::Arc;

use bytes::Bytes;

use crate::info::ConnectionId;
use crate::Error;

/// Owner of a connection handle, looked up by id whenever the handle has an
/// event to deliver.
///
/// Connection drivers never hold their owner directly. They resolve the
/// receiver through the loop's table at callback time, so an owner that has
/// gone away simply stops receiving events.
pub(crate) trait Receiver: Send + Sync + 'static {
    fn on_read(self: Arc<Self>, id: ConnectionId, result: Result<Bytes, Error>);

    fn on_write(self: Arc<Self>, id: ConnectionId, result: Result<usize, Error>);

    fn on_shutdown(self: Arc<Self>, id: ConnectionId, result: Result<(), Error>);

    /// Last event for `id`. The driver has already removed the entry from the
    /// receiver table.
    fn on_close(self: Arc<Self>, id: ConnectionId);
}
