//! Application payload sources and sinks for nodes

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, UdpSocket};
use std::path::Path;
use std::sync::{Arc, Mutex};

use rand::RngCore;

pub trait DataSource: Send {
    /// Reads up to `max` bytes. An empty result means the source is exhausted.
    fn read(&mut self, max: usize) -> io::Result<Vec<u8>>;
}

pub trait DataSink: Send {
    fn write(&mut self, data: &[u8]) -> io::Result<()>;
}

pub struct FileSource {
    file: File,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self { file: File::open(path)? })
    }
}

impl DataSource for FileSource {
    fn read(&mut self, max: usize) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(max);
        (&mut self.file).take(max as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }
}

#[derive(Default)]
pub struct RandomSource;

impl DataSource for RandomSource {
    fn read(&mut self, max: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; max];
        rand::rng().fill_bytes(&mut buf);
        Ok(buf)
    }
}

/// Endless stream of one repeated byte, ASCII `'5'` by default.
pub struct ConstantSource {
    byte: u8,
}

impl ConstantSource {
    pub fn new(byte: u8) -> Self {
        Self { byte }
    }
}

impl Default for ConstantSource {
    fn default() -> Self {
        Self::new(b'5')
    }
}

impl DataSource for ConstantSource {
    fn read(&mut self, max: usize) -> io::Result<Vec<u8>> {
        Ok(vec![self.byte; max])
    }
}

pub struct FileSink {
    file: File,
}

impl FileSink {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self { file: File::create(path)? })
    }
}

impl DataSink for FileSink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)
    }
}

/// Forwards every payload as one datagram, e.g. to a local media player.
pub struct UdpSink {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpSink {
    pub fn connect(target: SocketAddr) -> io::Result<Self> {
        let bind: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        Ok(Self { socket: UdpSocket::bind(bind)?, target })
    }
}

impl DataSink for UdpSink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.socket.send_to(data, self.target).map(|_| ())
    }
}

/// Collects payloads in memory; clones share the same store.
#[derive(Clone, Default)]
pub struct MemorySink {
    received: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.received.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn total_bytes(&self) -> usize {
        self.received
            .lock()
            .map(|r| r.iter().map(Vec::len).sum())
            .unwrap_or_default()
    }
}

impl DataSink for MemorySink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let mut received = self
            .received
            .lock()
            .map_err(|_| io::Error::other("memory sink poisoned"))?;
        received.push(data.to_vec());
        Ok(())
    }
}

#[derive(Default)]
pub struct DiscardSink;

impl DataSink for DiscardSink {
    fn write(&mut self, _data: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_and_random_sources_fill_requests() {
        assert_eq!(ConstantSource::default().read(4).unwrap(), b"5555".to_vec());
        assert_eq!(RandomSource.read(213).unwrap().len(), 213);
    }

    #[test]
    fn file_source_reads_in_chunks_until_exhausted() {
        let path = std::env::temp_dir().join(format!("relaying-source-{}", std::process::id()));
        std::fs::write(&path, vec![7u8; 300]).unwrap();

        let mut source = FileSource::open(&path).unwrap();
        assert_eq!(source.read(213).unwrap().len(), 213);
        assert_eq!(source.read(213).unwrap().len(), 87);
        assert!(source.read(213).unwrap().is_empty());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_file_is_reported() {
        let err = FileSource::open("/nonexistent/relaying/transfer_file.txt").err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn memory_sink_clones_share_storage() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.write(b"abc").unwrap();
        writer.write(b"de").unwrap();
        assert_eq!(sink.payloads(), vec![b"abc".to_vec(), b"de".to_vec()]);
        assert_eq!(sink.total_bytes(), 5);
    }

    #[test]
    fn file_sink_appends_payloads_in_order() {
        let path = std::env::temp_dir().join(format!("relaying-sink-{}", std::process::id()));
        {
            let mut sink = FileSink::create(&path).unwrap();
            sink.write(b"first ").unwrap();
            sink.write(b"second").unwrap();
        }
        assert_eq!(std::fs::read(&path).unwrap(), b"first second".to_vec());

        let mut source = FileSource::open(&path).unwrap();
        assert_eq!(source.read(213).unwrap(), b"first second".to_vec());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn udp_sink_sends_one_datagram_per_payload() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver.set_read_timeout(Some(std::time::Duration::from_secs(5))).unwrap();
        let mut sink = UdpSink::connect(receiver.local_addr().unwrap()).unwrap();

        sink.write(b"payload one").unwrap();
        sink.write(&[9u8; 213]).unwrap();

        let mut buf = [0u8; 512];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"payload one");
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[9u8; 213][..]);
    }

    #[test]
    fn discard_sink_accepts_everything() {
        let mut sink = DiscardSink;
        sink.write(&[]).unwrap();
        sink.write(&[1u8; 245]).unwrap();
    }
}
