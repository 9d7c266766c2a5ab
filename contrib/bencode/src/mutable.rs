use std::collections::BTreeMap;

/// An owned bencode value, used to build messages for the wire.
///
/// Encoding is always canonical: dictionary keys are emitted in ascending
/// byte order (the `BTreeMap` ordering) and integers minimally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    #[must_use]
    pub fn new_list() -> BencodeValue {
        BencodeValue::List(Vec::new())
    }

    #[must_use]
    pub fn new_dict() -> BencodeValue {
        BencodeValue::Dict(BTreeMap::new())
    }

    #[must_use]
    pub fn list_mut(&mut self) -> Option<&mut Vec<BencodeValue>> {
        match self {
            BencodeValue::List(list) => Some(list),
            _ => None,
        }
    }

    #[must_use]
    pub fn dict_mut(&mut self) -> Option<&mut BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(dict) => Some(dict),
            _ => None,
        }
    }

    /// Encodes the value into its canonical byte representation.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        encode(self, &mut bytes);
        bytes
    }
}

fn encode(val: &BencodeValue, bytes: &mut Vec<u8>) {
    match val {
        BencodeValue::Int(n) => encode_int(*n, bytes),
        BencodeValue::Bytes(n) => encode_bytes(n, bytes),
        BencodeValue::List(n) => encode_list(n, bytes),
        BencodeValue::Dict(n) => encode_dict(n, bytes),
    }
}

fn encode_int(val: i64, bytes: &mut Vec<u8>) {
    bytes.push(crate::INT_START);

    bytes.extend(val.to_string().into_bytes());

    bytes.push(crate::BEN_END);
}

fn encode_bytes(list: &[u8], bytes: &mut Vec<u8>) {
    bytes.extend(list.len().to_string().into_bytes());

    bytes.push(crate::BYTE_LEN_END);

    bytes.extend(list.iter().copied());
}

fn encode_list(list: &[BencodeValue], bytes: &mut Vec<u8>) {
    bytes.push(crate::LIST_START);

    for i in list {
        encode(i, bytes);
    }

    bytes.push(crate::BEN_END);
}

fn encode_dict(dict: &BTreeMap<Vec<u8>, BencodeValue>, bytes: &mut Vec<u8>) {
    // BTreeMap iteration order is the required key order.
    bytes.push(crate::DICT_START);
    for (key, value) in dict {
        encode_bytes(key, bytes);
        encode(value, bytes);
    }
    bytes.push(crate::BEN_END);
}

#[cfg(test)]
mod tests {
    use super::BencodeValue;
    use crate::reference::BencodeRef;
    use crate::{ben_bytes, ben_int, ben_list, ben_map};

    #[test]
    fn encode_int_zero() {
        assert_eq!(ben_int!(0).encode(), b"i0e");
    }

    #[test]
    fn encode_int_negative() {
        assert_eq!(ben_int!(-500_500).encode(), b"i-500500e");
    }

    #[test]
    fn encode_bytes_with_length_prefix() {
        assert_eq!(ben_bytes!("announce").encode(), b"8:announce");
    }

    #[test]
    fn encode_empty_containers() {
        assert_eq!(BencodeValue::new_list().encode(), b"le");
        assert_eq!(BencodeValue::new_dict().encode(), b"de");
    }

    #[test]
    fn encode_dict_sorts_keys() {
        let message = ben_map! {
            "zebra" => ben_int!(1),
            "alpha" => ben_int!(2)
        };

        assert_eq!(message.encode(), b"d5:alphai2e5:zebrai1ee");
    }

    #[test]
    fn encode_nested_structures() {
        let message = ben_map! {
            "list" => ben_list!(ben_int!(1), ben_bytes!("two")),
            "name" => ben_bytes!("nested")
        };

        assert_eq!(message.encode(), b"d4:listli1e3:twoe4:name6:nestede");
    }

    #[test]
    fn round_trip_decode_of_encoded_value_is_identity() {
        let value = ben_map! {
            "info" => ben_map! {
                "length" => ben_int!(20_480),
                "name" => ben_bytes!("file.bin"),
                "piece length" => ben_int!(16_384)
            },
            "url" => ben_bytes!("udp://test.com:80")
        };

        let encoded = value.encode();
        let decoded = BencodeRef::decode(&encoded).unwrap();

        assert_eq!(decoded.to_value(), value);
        // Re-encoding a decoded value reproduces the canonical bytes.
        assert_eq!(decoded.to_value().encode(), encoded);
    }
}
