//! The boundary between in-memory [`crate::event::Event`]s and the opaque
//! `(event_name, payload bytes)` pair a [`crate::records::DomainEventRecord`]
//! actually stores.
//!
//! One [`Codec`] exists per event family (domain / snapshot / integration
//! outbox / integration inbox). The reference implementation, [`JsonCodec`],
//! uses `serde_json`; any codec that is reversible for its registered types
//! is an acceptable substitute.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;
use crate::event::Message;

/// Converts between a payload `T` and the opaque bytes a record persists.
///
/// `decode` is handed the `event_name` that was stored alongside the bytes,
/// so implementations backed by a [`Registry`] can resolve which concrete
/// type to deserialize into.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, payload: &T) -> Result<(String, Vec<u8>), CodecError>;
    fn decode(&self, event_name: &str, payload: &[u8]) -> Result<T, CodecError>;
}

/// Reference codec: JSON via `serde_json`, for any `T` that is both a
/// [`Message`] (to supply `event_name` on encode) and serializable.
#[derive(Debug, Clone, Copy)]
pub struct JsonCodec<T>(PhantomData<T>);

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Message + Serialize + DeserializeOwned,
{
    fn encode(&self, payload: &T) -> Result<(String, Vec<u8>), CodecError> {
        let event_name = payload.name();
        let bytes =
            serde_json::to_vec(payload).map_err(|err| CodecError::new(event_name, err))?;
        Ok((event_name.to_string(), bytes))
    }

    fn decode(&self, event_name: &str, payload: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(payload).map_err(|err| CodecError::new(event_name, err))
    }
}

type DecodeFn<T> = Arc<dyn Fn(&[u8]) -> Result<T, CodecError> + Send + Sync>;

/// A type resolver: maps an `event_name` string to the concrete Rust type it
/// should be deserialized into, folded into a common output type `T`
/// (typically an enum covering every event a stream can contain).
///
/// Built once at startup via [`Registry::register`] and never mutated again;
/// there is no reflection on the hot path, only a `HashMap` lookup.
#[derive(Clone)]
pub struct Registry<T> {
    decoders: HashMap<String, DecodeFn<T>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }
}

impl<T: 'static> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the concrete wire type `E` under `event_name`. `E` must
    /// convert into the registry's output type `T`.
    #[must_use]
    pub fn register<E>(mut self, event_name: &'static str) -> Self
    where
        E: DeserializeOwned + Into<T> + 'static,
    {
        self.decoders.insert(
            event_name.to_string(),
            Arc::new(move |bytes: &[u8]| {
                serde_json::from_slice::<E>(bytes)
                    .map(Into::into)
                    .map_err(|err| CodecError::new(event_name, err))
            }),
        );
        self
    }

    pub fn decode(&self, event_name: &str, payload: &[u8]) -> Result<T, CodecError> {
        let decode = self.decoders.get(event_name).ok_or_else(|| {
            CodecError::new(
                event_name,
                anyhow::anyhow!("no decoder registered for event name '{event_name}'"),
            )
        })?;

        decode(payload)
    }
}

/// A [`Codec`] backed by a [`Registry`], for callers that need to decode a
/// stream whose events are a union of several concrete Rust types.
pub struct RegistryCodec<T> {
    registry: Registry<T>,
    encode: Arc<dyn Fn(&T) -> Result<(String, Vec<u8>), CodecError> + Send + Sync>,
}

impl<T> RegistryCodec<T> {
    pub fn new(
        registry: Registry<T>,
        encode: impl Fn(&T) -> Result<(String, Vec<u8>), CodecError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            registry,
            encode: Arc::new(encode),
        }
    }
}

impl<T: Send + Sync + 'static> Codec<T> for RegistryCodec<T> {
    fn encode(&self, payload: &T) -> Result<(String, Vec<u8>), CodecError> {
        (self.encode)(payload)
    }

    fn decode(&self, event_name: &str, payload: &[u8]) -> Result<T, CodecError> {
        self.registry.decode(event_name, payload)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Opened {
        balance: i64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum AccountEvent {
        Opened(Opened),
    }

    impl Message for AccountEvent {
        fn name(&self) -> &'static str {
            match self {
                AccountEvent::Opened(_) => "AccountOpened",
            }
        }
    }

    #[test]
    fn json_codec_round_trips() {
        let codec = JsonCodec::<AccountEvent>::default();
        let event = AccountEvent::Opened(Opened { balance: 100 });

        let (name, bytes) = codec.encode(&event).expect("encode should not fail");
        assert_eq!(name, "AccountOpened");

        let decoded = codec.decode(&name, &bytes).expect("decode should not fail");
        assert_eq!(decoded, event);
    }

    #[test]
    fn registry_resolves_by_event_name() {
        impl From<Opened> for AccountEvent {
            fn from(value: Opened) -> Self {
                AccountEvent::Opened(value)
            }
        }

        let registry = Registry::<AccountEvent>::new().register::<Opened>("AccountOpened");
        let codec = RegistryCodec::new(registry, |event: &AccountEvent| {
            let event_name = event.name();
            let bytes = match event {
                AccountEvent::Opened(opened) => serde_json::to_vec(opened),
            }
            .map_err(|err| CodecError::new(event_name, err))?;
            Ok((event_name.to_string(), bytes))
        });

        let event = AccountEvent::Opened(Opened { balance: 42 });
        let (name, bytes) = codec.encode(&event).unwrap();
        let decoded = codec.decode(&name, &bytes).unwrap();

        assert_eq!(decoded, event);
    }

    #[test]
    fn registry_decode_fails_for_unknown_event_name() {
        let registry = Registry::<AccountEvent>::new();
        let err = registry.decode("Unknown", b"{}").unwrap_err();
        assert_eq!(err.event_name, "Unknown");
    }
}
