//! fio/client: requesting side of the agent protocol.
//!
//! One Mutex-guarded channel per connection: a request is written, flushed,
//! and its response read while the lock is held, so frames never interleave.
//! Handles are allocated from a per-connection counter and tracked until
//! close; a response for a different opcode or handle is a protocol error.
//!
//! Any transport failure marks the channel broken. From then on synchronous
//! calls return TransportClosed and async writes are dropped; the failure is
//! still observed by the next synchronizing call on every handle.

use std::collections::HashMap;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::sync::Mutex;

use log::{debug, info, warn};

use super::compat::CompatibilityRecord;
use super::header::{FioHeader, Opcode, FIO_OK};
use super::as_str;
use crate::consts::{FIO_HDR_SIZE, FIO_PROTOCOL_VIOLATION, MAX_PAYLOAD_SIZE, PIPE_SIZE};
use crate::error::{PioError, PioResult};
use crate::metrics::{record_async_write, record_fio_received, record_fio_request, record_fio_sent};

pub type TransportReader = Box<dyn Read + Send>;
pub type TransportWriter = Box<dyn Write + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    File,
    Dir,
}

#[derive(Debug, Clone)]
struct HandleState {
    path: String,
    kind: HandleKind,
}

struct Channel {
    reader: BufReader<TransportReader>,
    writer: BufWriter<TransportWriter>,
    next_handle: u32,
    handles: HashMap<u32, HandleState>,
    broken: Option<String>,
    /// DISCONNECTED was received; the agent is exiting on its own.
    disconnected: bool,
}

impl Channel {
    fn fail(&mut self, err: std::io::Error) -> PioError {
        let reason = err.to_string();
        if self.broken.is_none() {
            warn!("agent transport failed: {}", reason);
            self.broken = Some(reason);
        }
        if matches!(err.kind(), ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe) {
            PioError::TransportClosed {
                reason: err.to_string(),
            }
        } else {
            PioError::TransportIo(err)
        }
    }

    fn check_alive(&self) -> PioResult<()> {
        match &self.broken {
            Some(reason) => Err(PioError::TransportClosed {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn send(&mut self, hdr: &FioHeader, payload: &[u8]) -> PioResult<()> {
        let res = self
            .writer
            .write_all(&hdr.encode())
            .and_then(|_| self.writer.write_all(payload))
            .and_then(|_| self.writer.flush());
        match res {
            Ok(()) => {
                record_fio_request();
                record_fio_sent((FIO_HDR_SIZE + payload.len()) as u64);
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn recv(&mut self) -> PioResult<(FioHeader, Vec<u8>)> {
        let mut hb = [0u8; FIO_HDR_SIZE];
        if let Err(e) = self.reader.read_exact(&mut hb) {
            return Err(self.fail(e));
        }
        let hdr = FioHeader::decode(&hb);
        let size = hdr.size as usize;
        if size > MAX_PAYLOAD_SIZE {
            let msg = format!("response payload of {size} bytes exceeds limit");
            self.broken = Some(msg.clone());
            return Err(PioError::Protocol(msg));
        }
        let mut payload = vec![0u8; size];
        if let Err(e) = self.reader.read_exact(&mut payload) {
            return Err(self.fail(e));
        }
        record_fio_received((FIO_HDR_SIZE + size) as u64);
        Ok((hdr, payload))
    }

    /// Response must answer `req`; anything else desynchronizes the stream.
    fn expect(&mut self, req: &FioHeader, resp: &FioHeader, also: Option<Opcode>) -> PioResult<()> {
        let ok_cop = resp.cop == req.cop || also.map(|o| resp.cop == o as u32).unwrap_or(false);
        if !ok_cop || resp.handle != req.handle {
            let msg = format!(
                "unexpected response cop={} handle={} to request cop={} handle={}",
                resp.cop, resp.handle, req.cop, req.handle
            );
            self.broken = Some(msg.clone());
            return Err(PioError::Protocol(msg));
        }
        Ok(())
    }
}

/// Translate a response `arg` into the common error taxonomy.
pub(crate) fn response_error(arg: u32, path: &str, payload: &[u8]) -> PioError {
    let msg = String::from_utf8_lossy(payload).into_owned();
    if arg == FIO_PROTOCOL_VIOLATION {
        return PioError::Protocol(msg);
    }
    PioError::from_errno(arg as i32, path, &msg)
}

pub struct FioClient {
    chan: Mutex<Channel>,
    remote_version: u32,
    remote_compat: CompatibilityRecord,
}

impl FioClient {
    /// Run the handshake over an established transport.
    pub fn connect(
        reader: TransportReader,
        writer: TransportWriter,
        local_version: u32,
        local_compat: &CompatibilityRecord,
    ) -> PioResult<Self> {
        let mut chan = Channel {
            reader: BufReader::with_capacity(PIPE_SIZE, reader),
            writer: BufWriter::with_capacity(PIPE_SIZE, writer),
            next_handle: 1,
            handles: HashMap::new(),
            broken: None,
            disconnected: false,
        };

        let req = FioHeader::new(Opcode::AgentVersion, 0, 0, 0);
        chan.send(&req, &[])?;
        let (resp, payload) = chan.recv()?;
        chan.expect(&req, &resp, None)?;

        let remote_version = resp.arg;
        if remote_version != local_version {
            return Err(PioError::ProtocolVersionMismatch {
                remote: remote_version,
                local: local_version,
            });
        }

        let actual = as_str(&payload)?.to_string();
        let expected = local_compat.serialize();
        if actual != expected {
            return Err(PioError::CompatibilityMismatch { expected, actual });
        }

        info!(
            "agent handshake ok: version {}, compatibility {}",
            crate::util::program_version_str(remote_version),
            actual.trim_end().replace('\n', ", ")
        );
        Ok(Self {
            chan: Mutex::new(chan),
            remote_version,
            remote_compat: CompatibilityRecord::parse(&actual),
        })
    }

    pub fn remote_version(&self) -> u32 {
        self.remote_version
    }

    pub fn remote_compat(&self) -> &CompatibilityRecord {
        &self.remote_compat
    }

    fn lock(&self) -> PioResult<std::sync::MutexGuard<'_, Channel>> {
        self.chan
            .lock()
            .map_err(|_| PioError::Protocol("agent channel lock poisoned".into()))
    }

    pub fn is_broken(&self) -> bool {
        self.lock().map(|c| c.broken.is_some()).unwrap_or(true)
    }

    /// Reserve a fresh handle for `path`.
    pub fn alloc_handle(&self, path: &str, kind: HandleKind) -> PioResult<u32> {
        let mut c = self.lock()?;
        let mut h = c.next_handle;
        while h == 0 || c.handles.contains_key(&h) {
            h = h.wrapping_add(1);
        }
        c.next_handle = h.wrapping_add(1);
        c.handles.insert(
            h,
            HandleState {
                path: path.to_string(),
                kind,
            },
        );
        Ok(h)
    }

    pub fn release_handle(&self, handle: u32) {
        if let Ok(mut c) = self.lock() {
            c.handles.remove(&handle);
        }
    }

    pub fn open_handles(&self) -> usize {
        self.lock().map(|c| c.handles.len()).unwrap_or(0)
    }

    fn check_handle(c: &Channel, hdr: &FioHeader, want: HandleKind) -> PioResult<()> {
        match c.handles.get(&hdr.handle) {
            Some(st) if st.kind == want => Ok(()),
            _ => Err(PioError::Protocol(format!("unknown handle {}", hdr.handle))),
        }
    }

    /// One request, one response. Returns the raw response.
    pub fn call(&self, hdr: FioHeader, payload: &[u8]) -> PioResult<(FioHeader, Vec<u8>)> {
        let mut c = self.lock()?;
        c.check_alive()?;
        c.send(&hdr, payload)?;
        let (resp, data) = c.recv()?;
        c.expect(&hdr, &resp, None)?;
        Ok((resp, data))
    }

    /// Request whose response `arg` is a result code; errors are folded for `path`.
    pub fn call_ok(&self, hdr: FioHeader, payload: &[u8], path: &str) -> PioResult<Vec<u8>> {
        let (resp, data) = self.call(hdr, payload)?;
        if resp.arg != FIO_OK {
            return Err(response_error(resp.arg, path, &data));
        }
        Ok(data)
    }

    /// Handle-scoped request; the handle must be open on this side.
    pub fn call_handle(&self, hdr: FioHeader, payload: &[u8], kind: HandleKind) -> PioResult<Vec<u8>> {
        let path = {
            let c = self.lock()?;
            Self::check_handle(&c, &hdr, kind)?;
            c.handles.get(&hdr.handle).map(|s| s.path.clone()).unwrap_or_default()
        };
        self.call_ok(hdr, payload, &path)
    }

    /// Fire-and-forget write. Dropped silently once the channel is broken;
    /// the breakage is reported by the next synchronizing call.
    pub fn send_async(&self, hdr: FioHeader, payload: &[u8]) -> PioResult<()> {
        let mut c = self.lock()?;
        Self::check_handle(&c, &hdr, HandleKind::File)?;
        if c.broken.is_some() {
            debug!("dropping async write on broken channel, handle {}", hdr.handle);
            return Ok(());
        }
        record_async_write();
        if let Err(e) = c.send(&hdr, payload) {
            debug!("async write failed: {}", e);
        }
        Ok(())
    }

    /// Streamed response: data frames of `data_cop` are passed to `on_chunk`
    /// until SEND_FILE_EOF or ERROR. A failing callback still drains the stream.
    pub fn call_stream<F>(&self, hdr: FioHeader, payload: &[u8], data_cop: Opcode, path: &str, mut on_chunk: F) -> PioResult<()>
    where
        F: FnMut(&[u8]) -> PioResult<()>,
    {
        self.stream(hdr, payload, &[data_cop], path, |_, _, data| on_chunk(data))
            .map(|_| ())
    }

    /// Streamed response of mixed data frames: every frame whose opcode is in
    /// `data_cops` goes to `on_frame` with its `arg`. Ends with the EOF frame
    /// (returned), an ERROR frame, or a SEND_FILE_CORRUPTION frame that
    /// carries the block number in `arg`. The channel stays usable after
    /// any of the three.
    pub fn stream<F>(
        &self,
        hdr: FioHeader,
        payload: &[u8],
        data_cops: &[Opcode],
        path: &str,
        mut on_frame: F,
    ) -> PioResult<FioHeader>
    where
        F: FnMut(Opcode, u32, &[u8]) -> PioResult<()>,
    {
        let mut c = self.lock()?;
        c.check_alive()?;
        c.send(&hdr, payload)?;

        let mut sink_err: Option<PioError> = None;
        let eof = loop {
            let (resp, data) = c.recv()?;
            if resp.handle != hdr.handle {
                let msg = format!("stream frame for handle {} while reading handle {}", resp.handle, hdr.handle);
                c.broken = Some(msg.clone());
                return Err(PioError::Protocol(msg));
            }
            match Opcode::try_from(resp.cop) {
                Ok(op) if data_cops.contains(&op) => {
                    if sink_err.is_none() {
                        if let Err(e) = on_frame(op, resp.arg, &data) {
                            sink_err = Some(e);
                        }
                    }
                }
                Ok(Opcode::SendFileEof) => break resp,
                Ok(Opcode::Error) => {
                    return Err(response_error(resp.arg, path, &data));
                }
                Ok(Opcode::SendFileCorruption) => {
                    return Err(PioError::PageCorruption {
                        path: path.to_string(),
                        blkno: resp.arg,
                        msg: String::from_utf8_lossy(&data).into_owned(),
                    });
                }
                _ => {
                    let msg = format!("unexpected frame cop={} in stream", resp.cop);
                    c.broken = Some(msg.clone());
                    return Err(PioError::Protocol(msg));
                }
            }
        };
        match sink_err {
            Some(e) => Err(e),
            None => Ok(eof),
        }
    }

    /// Polite shutdown: DISCONNECT then wait for DISCONNECTED.
    pub fn disconnect(&self) -> PioResult<()> {
        let mut c = self.lock()?;
        if c.broken.is_some() {
            return Ok(());
        }
        let req = FioHeader::new(Opcode::Disconnect, 0, 0, 0);
        c.send(&req, &[])?;
        let (resp, _) = c.recv()?;
        c.expect(&req, &resp, Some(Opcode::Disconnected))?;
        let outstanding = c.handles.len();
        if outstanding > 0 {
            warn!("disconnecting with {} open handle(s)", outstanding);
        }
        c.handles.clear();
        c.broken = Some("disconnected".to_string());
        c.disconnected = true;
        info!("agent connection closed");
        Ok(())
    }

    /// True once DISCONNECT has been acknowledged by the agent.
    pub fn is_disconnected(&self) -> bool {
        self.lock().map(|c| c.disconnected).unwrap_or(false)
    }

    /// Drop the write side of the transport so the agent sees end of input.
    /// The channel is unusable afterwards.
    pub fn close_transport(&self) {
        let Ok(mut c) = self.lock() else {
            return;
        };
        if c.broken.is_none() {
            c.broken = Some("transport closed".to_string());
        }
        let old = std::mem::replace(&mut c.writer, BufWriter::new(Box::new(std::io::sink())));
        let (writer, unflushed) = old.into_parts();
        if let Ok(buf) = unflushed {
            if !buf.is_empty() {
                debug!("discarding {} unsent byte(s) of agent output", buf.len());
            }
        }
        drop(writer);
    }
}
