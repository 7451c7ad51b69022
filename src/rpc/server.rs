//! Framed request/response transport for the RPC service over a UNIX
//! domain socket.
//!
//! The wire format here is deliberately replaceable: 4-byte big-endian
//! length-prefixed JSON objects, one request and one response per
//! frame, carrying the method set, the validation and the status
//! taxonomy of the service. Swapping in a generated-proto transport
//! would touch only this file. Each connection gets its own thread;
//! none of them touch simulator state directly.

use std::{
    io::{Read, Write},
    os::unix::net::{UnixListener, UnixStream},
    path::Path,
    sync::Arc,
    thread,
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{info, warn};
use serde_json::{json, Value};

use crate::{
    err::{RpcError, SockError},
    rpc::service::WmediumdService,
};

const MAX_REQUEST_LEN: u32 = 1 << 20;

/// Bind the server socket, replacing a stale one.
pub fn bind<P: AsRef<Path>>(path: P) -> Result<UnixListener, SockError> {
    let path = path.as_ref();
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    info!("rpc server listening on {}", path.display());
    Ok(listener)
}

/// Accept loop; one thread per connection. Runs until the listener
/// errors out, i.e. for the daemon's lifetime.
pub fn serve(listener: UnixListener, service: Arc<WmediumdService>) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let service = Arc::clone(&service);
                thread::spawn(move || {
                    if let Err(e) = serve_connection(stream, &service) {
                        match e {
                            SockError::Eof => {}
                            other => info!("rpc connection ended: {other}"),
                        }
                    }
                });
            }
            Err(e) => {
                warn!("rpc accept failed: {e}");
                return;
            }
        }
    }
}

fn serve_connection(mut stream: UnixStream, service: &WmediumdService) -> Result<(), SockError> {
    loop {
        let request = match read_frame(&mut stream)? {
            Some(request) => request,
            None => return Ok(()),
        };
        let response = match serde_json::from_slice::<Value>(&request) {
            Ok(request) => dispatch(service, &request),
            Err(e) => error_response(&RpcError::invalid(format!("bad request: {e}"))),
        };
        write_frame(&mut stream, &response)?;
    }
}

fn read_frame(stream: &mut UnixStream) -> Result<Option<Vec<u8>>, SockError> {
    let len = match stream.read_u32::<BigEndian>() {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(SockError::Io(e)),
    };
    if len > MAX_REQUEST_LEN {
        return Err(SockError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "oversize rpc request",
        )));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf)?;
    Ok(Some(buf))
}

fn write_frame(stream: &mut UnixStream, response: &Value) -> Result<(), SockError> {
    let bytes = serde_json::to_vec(response)
        .map_err(|e| SockError::Io(std::io::Error::other(e.to_string())))?;
    stream.write_u32::<BigEndian>(bytes.len() as u32)?;
    stream.write_all(&bytes)?;
    stream.flush()?;
    Ok(())
}

fn str_param<'a>(request: &'a Value, key: &str) -> Result<&'a str, RpcError> {
    request
        .get("params")
        .and_then(|p| p.get(key))
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::invalid(format!("missing string parameter {key}")))
}

fn f64_param(request: &Value, key: &str) -> Result<f64, RpcError> {
    request
        .get("params")
        .and_then(|p| p.get(key))
        .and_then(Value::as_f64)
        .ok_or_else(|| RpcError::invalid(format!("missing numeric parameter {key}")))
}

fn dispatch(service: &WmediumdService, request: &Value) -> Value {
    let method = request.get("method").and_then(Value::as_str).unwrap_or("");
    let outcome = match method {
        "SetPosition" => str_param(request, "mac_address").and_then(|mac| {
            let x = f64_param(request, "x_pos")?;
            let y = f64_param(request, "y_pos")?;
            service.set_position(mac, x, y).map(|_| Value::Null)
        }),
        "SetSnr" => str_param(request, "mac_address_1").and_then(|mac1| {
            let mac2 = str_param(request, "mac_address_2")?;
            let snr = f64_param(request, "snr")? as u8;
            service.set_snr(mac1, mac2, snr).map(|_| Value::Null)
        }),
        "SetTxpower" => str_param(request, "mac_address").and_then(|mac| {
            let dbm = f64_param(request, "tx_power")?;
            service.set_tx_power(mac, dbm).map(|_| Value::Null)
        }),
        "SetLci" => str_param(request, "mac_address").and_then(|mac| {
            let lci = str_param(request, "lci")?;
            service.set_lci(mac, lci.as_bytes().to_vec()).map(|_| Value::Null)
        }),
        "SetCivicloc" => str_param(request, "mac_address").and_then(|mac| {
            let civicloc = str_param(request, "civicloc")?;
            service
                .set_civicloc(mac, civicloc.as_bytes().to_vec())
                .map(|_| Value::Null)
        }),
        "LoadConfig" => {
            str_param(request, "path").and_then(|path| service.load_config(path).map(|_| Value::Null))
        }
        "ReloadConfig" => service.reload_config().map(|_| Value::Null),
        "StartPcap" => {
            str_param(request, "path").and_then(|path| service.start_pcap(path).map(|_| Value::Null))
        }
        "StopPcap" => service.stop_pcap().map(|_| Value::Null),
        "ListStations" => service.list_stations().map(|stations| {
            serde_json::to_value(stations).unwrap_or(Value::Null)
        }),
        other => Err(RpcError::invalid(format!("unknown method {other:?}"))),
    };
    match outcome {
        Ok(result) => json!({ "ok": true, "result": result }),
        Err(e) => error_response(&e),
    }
}

fn error_response(e: &RpcError) -> Value {
    json!({
        "ok": false,
        "status": e.status().to_string(),
        "message": e.message(),
    })
}
