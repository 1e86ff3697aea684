use std::any::Any;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use stagepipe_error::{Result, ResultExt};
use tracing::debug;

use crate::container::adaptor::StageAdaptor;
use crate::packet::PacketPayload;
use crate::stage::Stage;
use crate::tuple::Page;

/// Read fixed-size tuples from a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileScanPacket {
    pub path: PathBuf,
}

impl FileScanPacket {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileScanPacket { path: path.into() }
    }
}

impl PacketPayload for FileScanPacket {
    fn is_mergeable(&self, other: &dyn PacketPayload) -> bool {
        other
            .as_any()
            .downcast_ref::<FileScanPacket>()
            .is_some_and(|other| other == self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Default)]
pub struct FileScan;

impl Stage for FileScan {
    type Packet = FileScanPacket;

    const NAME: &'static str = "file_scan";

    fn process(&mut self, adaptor: &mut StageAdaptor, packet: &Self::Packet) -> Result<()> {
        let file = File::open(&packet.path)
            .context_fn(|| format!("Failed to open '{}'", packet.path.display()))?;
        let mut reader = BufReader::new(file);

        let mut page = Page::new(adaptor.tuple_size(), adaptor.config().page_size);
        let mut pages = 0;
        while page.fill_from_reader(&mut reader)? {
            // Packets joining after this point would miss tuples.
            if pages == 0 {
                adaptor.stop_accepting_packets();
            }
            pages += 1;

            if adaptor.output_page(&page)?.should_stop() {
                break;
            }
        }

        debug!(path = %packet.path.display(), pages, "file scan complete");

        Ok(())
    }
}
