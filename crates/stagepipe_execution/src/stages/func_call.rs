use std::any::Any;
use std::fmt;
use std::sync::Arc;

use stagepipe_error::Result;

use crate::container::adaptor::StageAdaptor;
use crate::packet::PacketPayload;
use crate::stage::Stage;

pub type FeedFn = Arc<dyn Fn(&mut StageAdaptor) -> Result<()> + Send + Sync>;

/// Runs a function that writes tuples directly to the adaptor.
///
/// Useful for feeding generated data into a pipeline. Never merged.
#[derive(Clone)]
pub struct FuncCallPacket {
    name: String,
    func: FeedFn,
}

impl FuncCallPacket {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&mut StageAdaptor) -> Result<()> + Send + Sync + 'static,
    {
        FuncCallPacket {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

impl fmt::Debug for FuncCallPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuncCallPacket")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl PacketPayload for FuncCallPacket {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Default)]
pub struct FuncCall;

impl Stage for FuncCall {
    type Packet = FuncCallPacket;

    const NAME: &'static str = "func_call";

    fn process(&mut self, adaptor: &mut StageAdaptor, packet: &Self::Packet) -> Result<()> {
        (packet.func)(adaptor)
    }
}
