use std::any::Any;

use stagepipe_error::Result;

use crate::container::adaptor::StageAdaptor;
use crate::packet::PacketPayload;
use crate::stage::Stage;

/// Forwards its single input unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EchoPacket;

impl PacketPayload for EchoPacket {
    fn is_mergeable(&self, other: &dyn PacketPayload) -> bool {
        other.as_any().is::<EchoPacket>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Default)]
pub struct Echo;

impl Stage for Echo {
    type Packet = EchoPacket;

    const NAME: &'static str = "echo";

    fn process(&mut self, adaptor: &mut StageAdaptor, _packet: &Self::Packet) -> Result<()> {
        let mut input = adaptor.dispatch_input(0)?;
        while let Some(page) = input.get_page()? {
            if adaptor.output_page(&page)?.should_stop() {
                break;
            }
        }
        Ok(())
    }
}
