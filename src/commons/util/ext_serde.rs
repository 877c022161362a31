//! Defines helper methods for Serializing and Deserializing external types.
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

//------------ Bytes ---------------------------------------------------------

pub fn de_bytes<'de, D>(d: D) -> Result<Bytes, D::Error>
where
    D: Deserializer<'de>,
{
    let some = String::deserialize(d)?;
    let dec = BASE64.decode(&some).map_err(de::Error::custom)?;
    Ok(Bytes::from(dec))
}

pub fn ser_bytes<S>(b: &Bytes, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    BASE64.encode(b).serialize(s)
}

pub fn de_bytes_opt<'de, D>(d: D) -> Result<Option<Bytes>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(d)? {
        Some(some) => {
            let dec = BASE64.decode(&some).map_err(de::Error::custom)?;
            Ok(Some(Bytes::from(dec)))
        }
        None => Ok(None),
    }
}

pub fn ser_bytes_opt<S>(b: &Option<Bytes>, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    b.as_ref().map(|b| BASE64.encode(b)).serialize(s)
}
