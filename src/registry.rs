use std::any::{Any, TypeId};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::{BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::buf::{put_string, try_get_string};
use crate::error::SerializationError;

/// A decoded message object as handed to listeners. `Arc` so queued and
/// threaded listener wrappers can share it without re-decoding.
pub type NetObject = Arc<dyn Any + Send + Sync>;

/// Wire codec for one message type. Implementations must be deterministic:
/// `deser` applied to the output of `ser` reproduces the value, and both
/// peers must agree on the encoding.
pub trait WireMessage: Any + Send + Sync + Sized {
    fn ser(&self, buf: &mut BytesMut);
    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self>;
}

/// First class id handed out by [`ObjectRegistry::register`]; lower ids are
/// reserved for framework messages.
pub const FIRST_CLASS_ID: u32 = 16;

struct ClassEntry {
    class_id: u32,
    type_name: &'static str,
    ser: Box<dyn Fn(&(dyn Any + Send + Sync), &mut BytesMut) + Send + Sync>,
    deser: Box<dyn Fn(&mut &[u8]) -> Result<NetObject, SerializationError> + Send + Sync>,
}

/// Maps registered Rust types to wire class ids and back.
///
/// Class ids are assigned in registration order, so **both peers must
/// register the same types in the same order**. A handful of primitive types
/// is pre-registered so they can be used as remote invocation arguments and
/// return values without ceremony.
pub struct ObjectRegistry {
    by_type: rustc_hash::FxHashMap<TypeId, usize>,
    by_id: rustc_hash::FxHashMap<u32, usize>,
    entries: Vec<ClassEntry>,
}

impl Debug for ObjectRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectRegistry({} classes)", self.entries.len())
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectRegistry {
    pub fn new() -> ObjectRegistry {
        let mut registry = ObjectRegistry {
            by_type: Default::default(),
            by_id: Default::default(),
            entries: Vec::new(),
        };
        registry.register::<i32>().expect("empty registry");
        registry.register::<i64>().expect("empty registry");
        registry.register::<f32>().expect("empty registry");
        registry.register::<f64>().expect("empty registry");
        registry.register::<bool>().expect("empty registry");
        registry.register::<String>().expect("empty registry");
        registry
    }

    /// Registers `T` under the next class id. Fails if `T` is already
    /// registered.
    pub fn register<T: WireMessage>(&mut self) -> anyhow::Result<()> {
        let type_id = TypeId::of::<T>();
        let type_name = std::any::type_name::<T>();
        if self.by_type.contains_key(&type_id) {
            bail!("type {} is already registered", type_name);
        }

        let class_id = FIRST_CLASS_ID + self.entries.len() as u32;
        let index = self.entries.len();
        self.entries.push(ClassEntry {
            class_id,
            type_name,
            ser: Box::new(|obj, buf| {
                let typed = obj
                    .downcast_ref::<T>()
                    .expect("class table lookup and object type diverged");
                typed.ser(buf);
            }),
            deser: Box::new(move |buf| {
                T::deser(buf)
                    .map(|v| Arc::new(v) as NetObject)
                    .map_err(|e| SerializationError::Malformed {
                        type_name,
                        cause: e,
                    })
            }),
        });
        self.by_type.insert(type_id, index);
        self.by_id.insert(class_id, index);
        Ok(())
    }

    /// Writes `varint(class_id) ‖ body` for a registered object.
    pub fn write_class_and_object(
        &self,
        buf: &mut BytesMut,
        obj: &(dyn Any + Send + Sync),
    ) -> Result<(), SerializationError> {
        let index = self
            .by_type
            .get(&obj.type_id())
            .ok_or(SerializationError::UnregisteredType {
                type_id: obj.type_id(),
            })?;
        let entry = &self.entries[*index];
        buf.put_u32_varint(entry.class_id);
        (entry.ser)(obj, buf);
        Ok(())
    }

    /// Reads `varint(class_id) ‖ body` and returns the decoded object.
    pub fn read_class_and_object(&self, buf: &mut &[u8]) -> Result<NetObject, SerializationError> {
        let class_id = buf
            .try_get_u32_varint()
            .map_err(|e| SerializationError::Malformed {
                type_name: "class id",
                cause: e.into(),
            })?;
        self.read_object(class_id, buf)
    }

    /// Reads the body of an object whose class id was already consumed.
    pub(crate) fn read_object(
        &self,
        class_id: u32,
        buf: &mut &[u8],
    ) -> Result<NetObject, SerializationError> {
        let index = self
            .by_id
            .get(&class_id)
            .ok_or(SerializationError::UnknownClassId { class_id })?;
        (self.entries[*index].deser)(buf)
    }

    /// Class name of a decoded object, for logging. Unregistered objects can
    /// only come from local construction, not off the wire.
    pub(crate) fn type_name_of(&self, obj: &NetObject) -> &'static str {
        self.by_type
            .get(&(**obj).type_id())
            .map(|&i| self.entries[i].type_name)
            .unwrap_or("<unregistered>")
    }
}

impl WireMessage for i32 {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_i32(*self);
    }
    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(buf.try_get_u32()? as i32)
    }
}

impl WireMessage for i64 {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_i64(*self);
    }
    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(buf.try_get_u64()? as i64)
    }
}

impl WireMessage for f32 {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_f32(*self);
    }
    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(f32::from_bits(buf.try_get_u32()?))
    }
}

impl WireMessage for f64 {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_f64(*self);
    }
    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(f64::from_bits(buf.try_get_u64()?))
    }
}

impl WireMessage for bool {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(*self as u8);
    }
    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
        match buf.try_get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(anyhow!("invalid bool encoding {}", other)),
        }
    }
}

impl WireMessage for String {
    fn ser(&self, buf: &mut BytesMut) {
        put_string(buf, self);
    }
    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
        try_get_string(buf)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[derive(Debug, PartialEq)]
    struct Probe {
        value: u32,
    }
    impl WireMessage for Probe {
        fn ser(&self, buf: &mut BytesMut) {
            buf.put_u32(self.value);
        }
        fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
            Ok(Probe {
                value: buf.try_get_u32()?,
            })
        }
    }

    #[test]
    fn test_round_trip_registered_type() {
        let mut registry = ObjectRegistry::new();
        registry.register::<Probe>().unwrap();

        let mut buf = BytesMut::new();
        registry
            .write_class_and_object(&mut buf, &Probe { value: 77 })
            .unwrap();

        let mut read_buf = &buf[..];
        let obj = registry.read_class_and_object(&mut read_buf).unwrap();
        assert!(read_buf.is_empty());
        assert_eq!(obj.downcast_ref::<Probe>(), Some(&Probe { value: 77 }));
    }

    #[rstest]
    #[case::int(&17i32)]
    #[case::long(&-9i64)]
    #[case::string(&"hello".to_string())]
    #[case::boolean(&true)]
    fn test_primitives_preregistered(#[case] obj: &(dyn Any + Send + Sync)) {
        let registry = ObjectRegistry::new();
        let mut buf = BytesMut::new();
        registry.write_class_and_object(&mut buf, obj).unwrap();
        registry.read_class_and_object(&mut &buf[..]).unwrap();
    }

    #[test]
    fn test_unregistered_type_is_rejected() {
        let registry = ObjectRegistry::new();
        let mut buf = BytesMut::new();
        let result = registry.write_class_and_object(&mut buf, &Probe { value: 1 });
        assert!(matches!(
            result,
            Err(SerializationError::UnregisteredType { .. })
        ));
    }

    #[test]
    fn test_unknown_class_id_is_rejected() {
        let registry = ObjectRegistry::new();
        let mut buf = BytesMut::new();
        buf.put_u32_varint(4711);
        let result = registry.read_class_and_object(&mut &buf[..]);
        assert!(matches!(
            result,
            Err(SerializationError::UnknownClassId { class_id: 4711 })
        ));
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut registry = ObjectRegistry::new();
        registry.register::<Probe>().unwrap();
        assert!(registry.register::<Probe>().is_err());
    }

    #[test]
    fn test_class_ids_are_deterministic() {
        // two registries built with the same registration order must encode
        // identically - this is what keeps peers compatible
        let mut a = ObjectRegistry::new();
        let mut b = ObjectRegistry::new();
        a.register::<Probe>().unwrap();
        b.register::<Probe>().unwrap();

        let mut buf_a = BytesMut::new();
        let mut buf_b = BytesMut::new();
        a.write_class_and_object(&mut buf_a, &Probe { value: 3 })
            .unwrap();
        b.write_class_and_object(&mut buf_b, &Probe { value: 3 })
            .unwrap();
        assert_eq!(buf_a, buf_b);
    }
}
