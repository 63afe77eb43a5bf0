//! 控制消息协议
//!
//! 代理与 worker 之间的类型化消息。线格式（全部小端）：
//!
//! ```text
//! payload := type:u32  num_params:u32  { key_len:u32 key  val_len:u32 val }*
//! ```
//!
//! 键值均为 UTF-8 字符串，参数表有序；数值参数以十进制文本编码，解码
//! 容忍坏值并回退到调用方默认值。

use std::collections::BTreeMap;

use crate::error::IpcError;

/// 消息类型
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // 命令（代理 → worker）
    Configure = 1,
    Start = 2,
    Stop = 3,
    Shutdown = 4,
    SetFrequency = 5,
    SetSampleRate = 6,
    SetGain = 7,
    SetAgc = 8,
    SetAntenna = 9,
    SetBandwidth = 10,
    GetStatus = 11,

    // 状态（worker → 代理）
    Ready = 100,
    Opened = 101,
    Configured = 102,
    Started = 103,
    Stopped = 104,
    Error = 105,
    Overflow = 106,
    Stats = 107,
    Ack = 108,
}

impl MessageType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(MessageType::Configure),
            2 => Some(MessageType::Start),
            3 => Some(MessageType::Stop),
            4 => Some(MessageType::Shutdown),
            5 => Some(MessageType::SetFrequency),
            6 => Some(MessageType::SetSampleRate),
            7 => Some(MessageType::SetGain),
            8 => Some(MessageType::SetAgc),
            9 => Some(MessageType::SetAntenna),
            10 => Some(MessageType::SetBandwidth),
            11 => Some(MessageType::GetStatus),
            100 => Some(MessageType::Ready),
            101 => Some(MessageType::Opened),
            102 => Some(MessageType::Configured),
            103 => Some(MessageType::Started),
            104 => Some(MessageType::Stopped),
            105 => Some(MessageType::Error),
            106 => Some(MessageType::Overflow),
            107 => Some(MessageType::Stats),
            108 => Some(MessageType::Ack),
            _ => None,
        }
    }

    /// 是否为状态类消息
    pub fn is_status(&self) -> bool {
        *self as u32 >= 100
    }
}

/// 控制消息：类型 + 有序参数表
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub msg_type: MessageType,
    params: BTreeMap<String, String>,
}

impl ControlMessage {
    pub fn new(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.set_param(key, value);
        self
    }

    pub fn set_param(&mut self, key: &str, value: impl Into<ParamValue>) {
        self.params.insert(key.to_string(), value.into().0);
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str())
    }

    pub fn param_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.param(key).unwrap_or(default)
    }

    /// 浮点参数；缺失或坏值返回默认
    pub fn param_f64(&self, key: &str, default: f64) -> f64 {
        self.param(key)
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(default)
    }

    /// 整数参数；缺失或坏值返回默认
    pub fn param_i64(&self, key: &str, default: i64) -> i64 {
        self.param(key)
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(default)
    }

    pub fn has_param(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    /// 序列化为线格式载荷（不含外层长度前缀）
    pub fn serialize(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(
            8 + self
                .params
                .iter()
                .map(|(k, v)| 8 + k.len() + v.len())
                .sum::<usize>(),
        );
        data.extend_from_slice(&(self.msg_type as u32).to_le_bytes());
        data.extend_from_slice(&(self.params.len() as u32).to_le_bytes());
        for (key, value) in &self.params {
            data.extend_from_slice(&(key.len() as u32).to_le_bytes());
            data.extend_from_slice(key.as_bytes());
            data.extend_from_slice(&(value.len() as u32).to_le_bytes());
            data.extend_from_slice(value.as_bytes());
        }
        data
    }

    /// 从线格式载荷解析
    pub fn deserialize(data: &[u8]) -> Result<Self, IpcError> {
        if data.len() < 8 {
            return Err(IpcError::MalformedMessage("payload shorter than header"));
        }
        let type_val = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let msg_type =
            MessageType::from_u32(type_val).ok_or(IpcError::MalformedMessage("unknown type"))?;
        let num_params = u32::from_le_bytes(data[4..8].try_into().unwrap());

        let mut msg = ControlMessage::new(msg_type);
        let mut pos = 8usize;
        for _ in 0..num_params {
            let key = read_string(data, &mut pos)?;
            let value = read_string(data, &mut pos)?;
            msg.params.insert(key, value);
        }
        Ok(msg)
    }
}

fn read_string(data: &[u8], pos: &mut usize) -> Result<String, IpcError> {
    if *pos + 4 > data.len() {
        return Err(IpcError::MalformedMessage("truncated length"));
    }
    let len = u32::from_le_bytes(data[*pos..*pos + 4].try_into().unwrap()) as usize;
    *pos += 4;
    if *pos + len > data.len() {
        return Err(IpcError::MalformedMessage("truncated string"));
    }
    let s = std::str::from_utf8(&data[*pos..*pos + len])
        .map_err(|_| IpcError::MalformedMessage("invalid utf-8"))?
        .to_string();
    *pos += len;
    Ok(s)
}

/// 参数值包装：字符串、浮点（最短可回读表示）与整数
pub struct ParamValue(pub String);

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        // Display 输出最短可精确回读的十进制表示
        ParamValue(format!("{v}"))
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue(v.to_string())
    }
}

impl From<u64> for ParamValue {
    fn from(v: u64) -> Self {
        ParamValue(v.to_string())
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue(if v { "1" } else { "0" }.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_empty() {
        let msg = ControlMessage::new(MessageType::Ready);
        let decoded = ControlMessage::deserialize(&msg.serialize()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_roundtrip_params() {
        let msg = ControlMessage::new(MessageType::Configure)
            .with_param("center_hz", 100.5e6)
            .with_param("sample_rate", 2e6)
            .with_param("antenna", "Antenna B")
            .with_param("agc", true)
            .with_param("gain", -7.25);
        let decoded = ControlMessage::deserialize(&msg.serialize()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.param_f64("center_hz", 0.0), 100.5e6);
        assert_eq!(decoded.param("antenna"), Some("Antenna B"));
        assert_eq!(decoded.param_i64("agc", 0), 1);
    }

    #[test]
    fn test_roundtrip_utf8_values() {
        // 任意 UTF-8 键值往返不变
        let msg = ControlMessage::new(MessageType::Error)
            .with_param("message", "天线切换失败: ∅→B")
            .with_param("клавиша", "значение");
        let decoded = ControlMessage::deserialize(&msg.serialize()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_f64_exact_roundtrip() {
        // 最短表示必须精确回读
        for v in [1.0 / 3.0, 1e-300, 2.4e6, -0.1, f64::MAX] {
            let msg = ControlMessage::new(MessageType::SetFrequency).with_param("value", v);
            let decoded = ControlMessage::deserialize(&msg.serialize()).unwrap();
            assert_eq!(decoded.param_f64("value", 0.0), v);
        }
    }

    #[test]
    fn test_malformed_value_falls_back_to_default() {
        let msg = ControlMessage::new(MessageType::SetGain).with_param("value", "not-a-number");
        assert_eq!(msg.param_f64("value", 40.0), 40.0);
        assert_eq!(msg.param_i64("value", -1), -1);
        assert_eq!(msg.param_f64("missing", 7.0), 7.0);
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        assert!(ControlMessage::deserialize(&[]).is_err());
        assert!(ControlMessage::deserialize(&[0xff; 8]).is_err());

        // 截断的参数表
        let msg = ControlMessage::new(MessageType::Stats).with_param("k", "v");
        let data = msg.serialize();
        assert!(ControlMessage::deserialize(&data[..data.len() - 1]).is_err());
    }

    #[test]
    fn test_param_order_is_stable() {
        let mut a = ControlMessage::new(MessageType::Stats);
        a.set_param("z", 1i64);
        a.set_param("a", 2i64);
        let mut b = ControlMessage::new(MessageType::Stats);
        b.set_param("a", 2i64);
        b.set_param("z", 1i64);
        // 有序参数表：序列化结果与插入顺序无关
        assert_eq!(a.serialize(), b.serialize());
    }
}
