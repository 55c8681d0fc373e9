/// 消息帧定义
///
/// 传输层只关心消息边界：4 字节小端总长度（含头部）+ 负载。
/// 具体的业务协议由上层解释。

use std::io::{Read, Write};
use bytes::{Bytes, BytesMut, BufMut};
use tokio_util::codec::LengthDelimitedCodec;

/// 帧头长度
pub const HEADER_LEN: usize = 4;

/// 单条消息允许的最大总长度
pub const MAX_MESSAGE_SIZE: usize = 48 * 1000 * 1000;

/// 一条完整的消息帧（头部 + 负载）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    frame: Bytes,
}

impl Message {
    /// 由负载构造消息，自动写入长度头
    pub fn from_payload(payload: impl AsRef<[u8]>) -> Self {
        let payload = payload.as_ref();
        let total = HEADER_LEN + payload.len();
        let mut buf = BytesMut::with_capacity(total);
        // 超出 u32 的长度无法表示，写入饱和值，发送前由 ensure_sendable 拒绝
        buf.put_u32_le(u32::try_from(total).unwrap_or(u32::MAX));
        buf.put_slice(payload);
        Self { frame: buf.freeze() }
    }

    /// 由完整帧构造消息，校验长度头
    pub fn from_frame(frame: Bytes) -> Result<Self, std::io::Error> {
        if frame.len() < HEADER_LEN {
            return Err(invalid_data("frame shorter than header"));
        }
        let declared = declared_len(&frame[..HEADER_LEN])?;
        if declared != frame.len() {
            return Err(invalid_data(format!(
                "declared length {} does not match frame length {}",
                declared,
                frame.len()
            )));
        }
        Ok(Self { frame })
    }

    /// 负载部分（零拷贝）
    pub fn payload(&self) -> Bytes {
        self.frame.slice(HEADER_LEN..)
    }

    /// 完整帧
    pub fn as_bytes(&self) -> &[u8] {
        &self.frame
    }

    /// 总长度（含头部）
    pub fn len(&self) -> usize {
        self.frame.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.len() == HEADER_LEN
    }

    /// 对端按 `MAX_MESSAGE_SIZE` 解码，超出的消息不能写出
    pub fn ensure_sendable(&self) -> crate::Result<()> {
        if self.frame.len() > MAX_MESSAGE_SIZE {
            return Err(crate::TransportError::connection_error(
                format!("message of {} bytes exceeds limit {}", self.frame.len(), MAX_MESSAGE_SIZE),
                false,
            ));
        }
        Ok(())
    }
}

/// 异步后端使用的帧编解码器
///
/// 长度字段计入头部本身；解码去掉头部只返回负载，编码时同样只传入负载。
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(HEADER_LEN)
        .length_adjustment(-(HEADER_LEN as isize))
        .num_skip(HEADER_LEN)
        .little_endian()
        .max_frame_length(MAX_MESSAGE_SIZE - HEADER_LEN)
        .new_codec()
}

/// 阻塞读取一条完整消息
///
/// 对端在帧边界处关闭连接时返回 `Ok(None)`。读超时若发生在帧中间，
/// 流已无法重新对齐，返回 `InvalidData` 而不是超时。
pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<Message>, std::io::Error> {
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) if filled > 0 && is_timeout(&e) => return Err(invalid_data("deadline expired mid-frame")),
            Err(e) => return Err(e),
        }
    }

    let total = declared_len(&header)?;
    let mut frame = BytesMut::zeroed(total);
    frame[..HEADER_LEN].copy_from_slice(&header);
    reader.read_exact(&mut frame[HEADER_LEN..]).map_err(|e| {
        if is_timeout(&e) {
            invalid_data("deadline expired mid-frame")
        } else {
            e
        }
    })?;

    Ok(Some(Message { frame: frame.freeze() }))
}

/// 阻塞写出一条完整消息
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<(), std::io::Error> {
    writer.write_all(message.as_bytes())?;
    writer.flush()
}

fn declared_len(header: &[u8]) -> Result<usize, std::io::Error> {
    let total = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if total < HEADER_LEN || total > MAX_MESSAGE_SIZE {
        return Err(invalid_data(format!("invalid message length {}", total)));
    }
    Ok(total)
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut)
}

fn invalid_data(reason: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, reason.into())
}
