//! Opcode protocol spoken between a remote host and its worker client.
//!
//! Every message starts with a little-endian `u32` opcode followed by the
//! opcode's payload:
//!
//! - strings: `u32` byte length, then UTF-8 bytes
//! - floats: little-endian `f32`
//! - booleans: one byte, `0` or `1`
//! - colours: three bytes, red green blue
//! - module paths: `u32` count (`0` = absent), then `u32` indices
//!
//! Messages are encoded into a buffer first and written with a single
//! `write_all`, so concurrent writers never interleave partial frames as
//! long as they share one writer handle.

use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ErrorWithPath, ModulePath, ProtocolError};
use crate::model::ProgressReport;
use crate::types::{Colour, ConfigReference, RunName};

/// Upper bound for any single string or list on the wire.
pub const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Opcodes sent by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ToClient {
    Heartbeat = 0,
    RunModelSystem = 1,
    CancelModelRun = 2,
    KillModelRun = 3,
    RequestProgress = 4,
    RequestStatus = 5,
}

impl TryFrom<u32> for ToClient {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Heartbeat,
            1 => Self::RunModelSystem,
            2 => Self::CancelModelRun,
            3 => Self::KillModelRun,
            4 => Self::RequestProgress,
            5 => Self::RequestStatus,
            other => return Err(ProtocolError::UnknownOpcode(other)),
        })
    }
}

/// Opcodes sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ToHost {
    Heartbeat = 0,
    ClientReady = 1,
    ClientExiting = 2,
    ClientFinishedModelSystem = 3,
    ClientErrorWhenRunningModelSystem = 4,
    ClientErrorValidatingModelSystem = 5,
    ClientReportedProgress = 6,
    ClientReportedStatus = 7,
    SendModelSystemResult = 8,
    RuntimeError = 9,
    ClientCreatedProgressReport = 10,
    ClientRemovedProgressReport = 11,
    ClientClearedProgressReports = 12,
}

impl TryFrom<u32> for ToHost {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Heartbeat,
            1 => Self::ClientReady,
            2 => Self::ClientExiting,
            3 => Self::ClientFinishedModelSystem,
            4 => Self::ClientErrorWhenRunningModelSystem,
            5 => Self::ClientErrorValidatingModelSystem,
            6 => Self::ClientReportedProgress,
            7 => Self::ClientReportedStatus,
            8 => Self::SendModelSystemResult,
            9 => Self::RuntimeError,
            10 => Self::ClientCreatedProgressReport,
            11 => Self::ClientRemovedProgressReport,
            12 => Self::ClientClearedProgressReports,
            other => return Err(ProtocolError::UnknownOpcode(other)),
        })
    }
}

/// Which validation pass rejected the model system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValidationStage {
    Structural = 0,
    Runtime = 1,
}

impl TryFrom<u8> for ValidationStage {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Structural),
            1 => Ok(Self::Runtime),
            other => Err(ProtocolError::UnknownStage(other)),
        }
    }
}

/// Payload of `RunModelSystem`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub config: ConfigReference,
    pub run_name: RunName,
    pub run_directory: PathBuf,
    pub overwrite: bool,
    /// Serialized [`crate::model::ModelSystemDocument`].
    pub model_system: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostMessage {
    Heartbeat,
    RunModelSystem(RunRequest),
    CancelModelRun,
    KillModelRun,
    RequestProgress,
    RequestStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Heartbeat,
    Ready,
    Exiting,
    Finished,
    ErrorWhenRunning(ErrorWithPath),
    ErrorValidating {
        stage: ValidationStage,
        errors: Vec<ErrorWithPath>,
    },
    /// Overall progress plus the current value of every named report.
    Progress {
        progress: f32,
        reports: Vec<ProgressReport>,
    },
    Status(String),
    ModelSystemResult(String),
    /// A complaint about the protocol itself; does not end the run.
    RuntimeError(String),
    ReportCreated {
        name: String,
        colour: Colour,
    },
    ReportRemoved(String),
    ReportsCleared,
}

impl ClientMessage {
    /// The three outcomes that end the host's listener loop.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished | Self::ErrorWhenRunning(_) | Self::ErrorValidating { .. }
        )
    }

    pub fn opcode(&self) -> ToHost {
        match self {
            Self::Heartbeat => ToHost::Heartbeat,
            Self::Ready => ToHost::ClientReady,
            Self::Exiting => ToHost::ClientExiting,
            Self::Finished => ToHost::ClientFinishedModelSystem,
            Self::ErrorWhenRunning(_) => ToHost::ClientErrorWhenRunningModelSystem,
            Self::ErrorValidating { .. } => ToHost::ClientErrorValidatingModelSystem,
            Self::Progress { .. } => ToHost::ClientReportedProgress,
            Self::Status(_) => ToHost::ClientReportedStatus,
            Self::ModelSystemResult(_) => ToHost::SendModelSystemResult,
            Self::RuntimeError(_) => ToHost::RuntimeError,
            Self::ReportCreated { .. } => ToHost::ClientCreatedProgressReport,
            Self::ReportRemoved(_) => ToHost::ClientRemovedProgressReport,
            Self::ReportsCleared => ToHost::ClientClearedProgressReports,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::with_capacity(16);
        put_u32(&mut buf, self.opcode() as u32);
        match self {
            Self::Heartbeat | Self::Ready | Self::Exiting | Self::Finished | Self::ReportsCleared => {}
            Self::ErrorWhenRunning(error) => put_error(&mut buf, error)?,
            Self::ErrorValidating { stage, errors } => {
                buf.push(*stage as u8);
                put_len(&mut buf, errors.len())?;
                for error in errors {
                    put_error(&mut buf, error)?;
                }
            }
            Self::Progress { progress, reports } => {
                buf.extend_from_slice(&progress.to_le_bytes());
                put_len(&mut buf, reports.len())?;
                for report in reports {
                    put_string(&mut buf, &report.name)?;
                    buf.extend_from_slice(&report.progress.to_le_bytes());
                    put_colour(&mut buf, report.colour);
                }
            }
            Self::ReportCreated { name, colour } => {
                put_string(&mut buf, name)?;
                put_colour(&mut buf, *colour);
            }
            Self::Status(text)
            | Self::ModelSystemResult(text)
            | Self::RuntimeError(text)
            | Self::ReportRemoved(text) => put_string(&mut buf, text)?,
        }
        Ok(buf)
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), ProtocolError> {
        let frame = self.encode()?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, ProtocolError> {
        let opcode = ToHost::try_from(reader.read_u32_le().await?)?;
        Ok(match opcode {
            ToHost::Heartbeat => Self::Heartbeat,
            ToHost::ClientReady => Self::Ready,
            ToHost::ClientExiting => Self::Exiting,
            ToHost::ClientFinishedModelSystem => Self::Finished,
            ToHost::ClientErrorWhenRunningModelSystem => Self::ErrorWhenRunning(read_error(reader).await?),
            ToHost::ClientErrorValidatingModelSystem => {
                let stage = ValidationStage::try_from(reader.read_u8().await?)?;
                let count = read_len(reader).await?;
                let mut errors = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    errors.push(read_error(reader).await?);
                }
                Self::ErrorValidating { stage, errors }
            }
            ToHost::ClientReportedProgress => {
                let progress = reader.read_f32_le().await?;
                let count = read_len(reader).await?;
                let mut reports = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    reports.push(ProgressReport {
                        name: read_string(reader, "report_name").await?,
                        progress: reader.read_f32_le().await?,
                        colour: read_colour(reader).await?,
                    });
                }
                Self::Progress { progress, reports }
            }
            ToHost::ClientReportedStatus => Self::Status(read_string(reader, "status").await?),
            ToHost::SendModelSystemResult => {
                Self::ModelSystemResult(read_string(reader, "model_system").await?)
            }
            ToHost::RuntimeError => Self::RuntimeError(read_string(reader, "message").await?),
            ToHost::ClientCreatedProgressReport => Self::ReportCreated {
                name: read_string(reader, "report_name").await?,
                colour: read_colour(reader).await?,
            },
            ToHost::ClientRemovedProgressReport => {
                Self::ReportRemoved(read_string(reader, "report_name").await?)
            }
            ToHost::ClientClearedProgressReports => Self::ReportsCleared,
        })
    }
}

impl HostMessage {
    pub fn opcode(&self) -> ToClient {
        match self {
            Self::Heartbeat => ToClient::Heartbeat,
            Self::RunModelSystem(_) => ToClient::RunModelSystem,
            Self::CancelModelRun => ToClient::CancelModelRun,
            Self::KillModelRun => ToClient::KillModelRun,
            Self::RequestProgress => ToClient::RequestProgress,
            Self::RequestStatus => ToClient::RequestStatus,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::with_capacity(16);
        put_u32(&mut buf, self.opcode() as u32);
        if let Self::RunModelSystem(request) = self {
            put_string(&mut buf, request.config.as_str())?;
            put_string(&mut buf, request.run_name.as_str())?;
            put_string(&mut buf, &request.run_directory.to_string_lossy())?;
            buf.push(u8::from(request.overwrite));
            put_string(&mut buf, &request.model_system)?;
        }
        Ok(buf)
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), ProtocolError> {
        let frame = self.encode()?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, ProtocolError> {
        let opcode = ToClient::try_from(reader.read_u32_le().await?)?;
        Ok(match opcode {
            ToClient::Heartbeat => Self::Heartbeat,
            ToClient::RunModelSystem => {
                let config = ConfigReference::new(read_string(reader, "config").await?);
                let run_name = RunName::new(read_string(reader, "run_name").await?);
                let run_directory = PathBuf::from(read_string(reader, "run_directory").await?);
                let overwrite = reader.read_u8().await? != 0;
                let model_system = read_string(reader, "model_system").await?;
                Self::RunModelSystem(RunRequest {
                    config,
                    run_name,
                    run_directory,
                    overwrite,
                    model_system,
                })
            }
            ToClient::CancelModelRun => Self::CancelModelRun,
            ToClient::KillModelRun => Self::KillModelRun,
            ToClient::RequestProgress => Self::RequestProgress,
            ToClient::RequestStatus => Self::RequestStatus,
        })
    }
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_len(buf: &mut Vec<u8>, len: usize) -> Result<(), ProtocolError> {
    if len > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(len));
    }
    put_u32(buf, len as u32);
    Ok(())
}

fn put_string(buf: &mut Vec<u8>, text: &str) -> Result<(), ProtocolError> {
    put_len(buf, text.len())?;
    buf.extend_from_slice(text.as_bytes());
    Ok(())
}

fn put_colour(buf: &mut Vec<u8>, Colour(r, g, b): Colour) {
    buf.extend_from_slice(&[r, g, b]);
}

fn put_error(buf: &mut Vec<u8>, error: &ErrorWithPath) -> Result<(), ProtocolError> {
    let indices = error.path.as_ref().map(ModulePath::indices).unwrap_or_default();
    put_len(buf, indices.len())?;
    for index in indices {
        put_u32(buf, *index as u32);
    }
    put_string(buf, &error.message)?;
    put_string(buf, error.stack_trace.as_deref().unwrap_or_default())?;
    put_string(buf, error.module_name.as_deref().unwrap_or_default())
}

async fn read_len<R: AsyncRead + Unpin>(reader: &mut R) -> Result<usize, ProtocolError> {
    let len = reader.read_u32_le().await? as usize;
    if len > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(len));
    }
    Ok(len)
}

async fn read_string<R: AsyncRead + Unpin>(reader: &mut R, field: &'static str) -> Result<String, ProtocolError> {
    let len = read_len(reader).await?;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;
    String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8(field))
}

async fn read_colour<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Colour, ProtocolError> {
    let mut rgb = [0u8; 3];
    reader.read_exact(&mut rgb).await?;
    Ok(Colour(rgb[0], rgb[1], rgb[2]))
}

async fn read_error<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ErrorWithPath, ProtocolError> {
    let count = read_len(reader).await?;
    let path = if count == 0 {
        None
    } else {
        let mut indices = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            indices.push(reader.read_u32_le().await? as usize);
        }
        Some(ModulePath::from(indices))
    };
    let message = read_string(reader, "message").await?;
    let stack_trace = read_string(reader, "stack_trace").await?;
    let module_name = read_string(reader, "module_name").await?;

    let error = ErrorWithPath::new(path, message).with_stack_trace(stack_trace);
    Ok(if module_name.is_empty() {
        error
    } else {
        error.with_module_name(module_name)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_run_request_layout() {
        let message = HostMessage::RunModelSystem(RunRequest {
            config: ConfigReference::new("c"),
            run_name: RunName::new("r"),
            run_directory: PathBuf::from("d"),
            overwrite: true,
            model_system: "{}".into(),
        });
        let frame = message.encode().unwrap();
        assert_eq!(&frame[..4], &1u32.to_le_bytes());
        // opcode, three 1-byte strings, flag, 2-byte string
        assert_eq!(frame.len(), 4 + 3 * (4 + 1) + 1 + (4 + 2));
        assert_eq!(frame[4 + 15], 1);
    }

    #[test]
    fn test_absent_path_encodes_as_zero_count() {
        let frame = ClientMessage::ErrorWhenRunning(ErrorWithPath::unattributed("x"))
            .encode()
            .unwrap();
        assert_eq!(&frame[4..8], &0u32.to_le_bytes());
    }

    #[tokio::test]
    async fn test_client_messages_over_stream() {
        let (mut a, mut b) = duplex(4096);
        let sent = vec![
            ClientMessage::Ready,
            ClientMessage::Progress {
                progress: 0.25,
                reports: vec![ProgressReport {
                    name: "Skims".into(),
                    progress: 0.5,
                    colour: Colour(200, 10, 0),
                }],
            },
            ClientMessage::ReportCreated {
                name: "Skims".into(),
                colour: Colour(200, 10, 0),
            },
            ClientMessage::ReportRemoved("Skims".into()),
            ClientMessage::ReportsCleared,
            ClientMessage::Status("Assigning trips".into()),
            ClientMessage::ErrorValidating {
                stage: ValidationStage::Runtime,
                errors: vec![
                    ErrorWithPath::new(Some(vec![2, 1].into()), "bad value").with_module_name("Zones"),
                    ErrorWithPath::unattributed("no root"),
                ],
            },
            ClientMessage::ErrorWhenRunning(
                ErrorWithPath::new(Some(vec![0].into()), "boom").with_stack_trace("at solve"),
            ),
        ];
        for message in &sent {
            message.write_to(&mut a).await.unwrap();
        }
        drop(a);

        let mut received = Vec::new();
        for _ in 0..sent.len() {
            received.push(ClientMessage::read_from(&mut b).await.unwrap());
        }
        assert_eq!(received, sent);
        assert!(ClientMessage::read_from(&mut b).await.unwrap_err().is_disconnect());
    }

    #[tokio::test]
    async fn test_unknown_opcode_is_rejected() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&77u32.to_le_bytes()).await.unwrap();
        assert!(matches!(
            HostMessage::read_from(&mut b).await,
            Err(ProtocolError::UnknownOpcode(77))
        ));
    }

    #[tokio::test]
    async fn test_invalid_utf8_names_the_field() {
        let (mut a, mut b) = duplex(64);
        let mut frame = (ToHost::ClientReportedStatus as u32).to_le_bytes().to_vec();
        frame.extend_from_slice(&2u32.to_le_bytes());
        frame.extend_from_slice(&[0xff, 0xfe]);
        a.write_all(&frame).await.unwrap();
        assert!(matches!(
            ClientMessage::read_from(&mut b).await,
            Err(ProtocolError::InvalidUtf8("status"))
        ));
    }

    #[test]
    fn test_report_created_layout() {
        let frame = ClientMessage::ReportCreated {
            name: "AB".into(),
            colour: Colour(1, 2, 3),
        }
        .encode()
        .unwrap();
        assert_eq!(&frame[..4], &10u32.to_le_bytes());
        assert_eq!(&frame[4..8], &2u32.to_le_bytes());
        assert_eq!(&frame[8..], b"AB\x01\x02\x03");
    }

    #[test]
    fn test_terminal_opcodes() {
        assert!(ClientMessage::Finished.is_terminal());
        assert!(!ClientMessage::Exiting.is_terminal());
        assert!(!ClientMessage::RuntimeError("noise".into()).is_terminal());
    }
}
