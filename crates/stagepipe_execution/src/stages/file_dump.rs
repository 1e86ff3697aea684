use std::any::Any;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use stagepipe_error::{Result, ResultExt};
use tracing::debug;

use crate::container::adaptor::StageAdaptor;
use crate::packet::PacketPayload;
use crate::stage::Stage;

/// Write every tuple of the input to a file.
///
/// Nothing is output. The output fifo only gets EOF once the file is
/// written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDumpPacket {
    pub path: PathBuf,
}

impl FileDumpPacket {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileDumpPacket { path: path.into() }
    }
}

impl PacketPayload for FileDumpPacket {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Default)]
pub struct FileDump;

impl Stage for FileDump {
    type Packet = FileDumpPacket;

    const NAME: &'static str = "file_dump";

    fn process(&mut self, adaptor: &mut StageAdaptor, packet: &Self::Packet) -> Result<()> {
        let file = File::create(&packet.path)
            .context_fn(|| format!("Failed to create '{}'", packet.path.display()))?;
        let mut writer = BufWriter::new(file);

        let mut input = adaptor.dispatch_input(0)?;
        let mut tuples = 0;
        while let Some(page) = input.get_page()? {
            tuples += page.tuple_count();
            page.write_to(&mut writer)?;
        }
        writer.flush()?;

        debug!(path = %packet.path.display(), tuples, "file dump complete");

        Ok(())
    }
}
