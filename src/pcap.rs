//! Packet capture of delivered frames.
//!
//! Standard libpcap format via the `pcap-file` crate, link type
//! IEEE 802.11, microsecond timestamps equal to simulated TX-start.
//! Writes happen only on the scheduler thread.

use std::{
    fs::File,
    io::BufWriter,
    path::Path,
    time::Duration,
};

use pcap_file::{
    pcap::{PcapHeader, PcapPacket, PcapWriter},
    DataLink, Endianness, TsResolution,
};

use crate::err::ConfigError;

/// An open capture file.
pub struct PcapSink {
    writer: PcapWriter<BufWriter<File>>,
}

impl PcapSink {
    /// Create (truncating) a capture file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file =
            File::create(path).map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        let header = PcapHeader {
            version_major: 2,
            version_minor: 4,
            ts_correction: 0,
            ts_accuracy: 0,
            snaplen: 65535,
            datalink: DataLink::IEEE802_11,
            ts_resolution: TsResolution::MicroSecond,
            endianness: Endianness::native(),
        };
        let writer = PcapWriter::with_header(BufWriter::new(file), header)
            .map_err(|e| ConfigError::PerTable(format!("pcap header: {e}")))?;
        Ok(PcapSink { writer })
    }

    /// Append one frame with the given simulated timestamp.
    pub fn write(&mut self, ts_us: u64, frame: &[u8]) -> Result<(), std::io::Error> {
        let packet = PcapPacket::new(
            Duration::from_micros(ts_us),
            frame.len() as u32,
            frame,
        );
        self.writer
            .write_packet(&packet)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_capture_roundtrip() {
        let path = std::env::temp_dir().join(format!("wmediumd-cap-{}.pcap", std::process::id()));
        {
            let mut sink = PcapSink::open(&path).unwrap();
            sink.write(1_000_000, &[0x80; 32]).unwrap();
            sink.write(2_000_000, &[0x08; 64]).unwrap();
        }
        let file = File::open(&path).unwrap();
        let mut reader = pcap_file::pcap::PcapReader::new(file).unwrap();
        let first = reader.next_packet().unwrap().unwrap();
        assert_eq!(first.data.len(), 32);
        assert_eq!(first.timestamp, Duration::from_micros(1_000_000));
        let second = reader.next_packet().unwrap().unwrap();
        assert_eq!(second.data.len(), 64);
        assert!(reader.next_packet().is_none());
        std::fs::remove_file(&path).unwrap();
    }
}
