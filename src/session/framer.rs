use crate::config::FrameFormat;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

/// 将后端读到的字节块包装为 WebSocket 消息
///
/// 文本模式下，被块边界截断的多字节 UTF-8 序列留到下一块拼接；
/// 非法字节以 U+FFFD 替换
#[derive(Debug)]
pub struct Framer {
    format: FrameFormat,
    pending: Vec<u8>,
}

impl Framer {
    pub fn new(format: FrameFormat) -> Self {
        Self {
            format,
            pending: Vec::new(),
        }
    }

    /// 包装一个字节块；文本模式下只有不完整字符时返回 None
    pub fn frame(&mut self, chunk: &[u8]) -> Option<Message> {
        match self.format {
            FrameFormat::Binary => Some(Message::binary(chunk.to_vec())),
            FrameFormat::Text => {
                self.pending.extend_from_slice(chunk);
                self.drain_text(false)
            }
        }
    }

    /// 流结束时输出残留字节
    pub fn finish(&mut self) -> Option<Message> {
        match self.format {
            FrameFormat::Binary => None,
            FrameFormat::Text => self.drain_text(true),
        }
    }

    fn drain_text(&mut self, at_end: bool) -> Option<Message> {
        let mut out = String::with_capacity(self.pending.len());
        let mut replaced = false;
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            replaced = true;
                            rest = &after[len..];
                        }
                        None if at_end => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            replaced = true;
                            rest = &[];
                            break;
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        let tail = rest.to_vec();
        self.pending = tail;

        if replaced {
            warn!("Backend sent invalid UTF-8 in text mode, replaced lossily");
        }

        if out.is_empty() {
            None
        } else {
            Some(Message::text(out))
        }
    }
}
