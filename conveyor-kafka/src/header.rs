use bincode::config::{Configuration, Fixint, Limit, LittleEndian};
use conveyor::ConsumerError;
use rdkafka::message::{BorrowedMessage, Headers, Message};

/// 投递次数消息头
pub const ATTEMPTS: &str = "attempts";

/// bincode 定长投递次数头配置
pub const ATTEMPTS_HEADER: Configuration<LittleEndian, Fixint, Limit<2>> =
    bincode::config::standard()
        .with_fixed_int_encoding()
        .with_limit::<2>();

pub(crate) fn encode_attempts(attempts: u16) -> Result<[u8; 2], ConsumerError> {
    let mut buf = [0u8; 2];
    bincode::encode_into_slice(attempts, &mut buf, ATTEMPTS_HEADER)
        .map_err(|e| ConsumerError::Broker(format!("编码投递次数失败：{e}")))?;
    Ok(buf)
}

pub(crate) fn decode_attempts(value: &[u8]) -> Option<u16> {
    bincode::decode_from_slice::<u16, _>(value, ATTEMPTS_HEADER)
        .ok()
        .map(|(attempts, _)| attempts)
}

/// 读取消息的投递次数，缺失或无法解析时视为首次投递
pub(crate) fn attempts(msg: &BorrowedMessage<'_>) -> u16 {
    msg.headers()
        .and_then(|headers| headers.iter().find(|h| h.key == ATTEMPTS))
        .and_then(|h| h.value)
        .and_then(decode_attempts)
        .unwrap_or(1)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_header_is_two_bytes() {
        let buf = encode_attempts(3).unwrap();
        assert_eq!(buf, [3, 0]);
        assert_eq!(decode_attempts(&buf), Some(3));
    }

    #[test]
    fn malformed_header_is_rejected() {
        assert_eq!(decode_attempts(&[]), None);
        assert_eq!(decode_attempts(&[1]), None);
    }
}
