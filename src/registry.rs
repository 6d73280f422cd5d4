//! Decode function registry.
//!
//! A [`DecodeRegistry`] maps a method name to a `bytes -> values` transform.
//! Protocol definitions reference decode methods purely by name; the
//! compiler resolves every name at startup and an unknown name fails
//! compilation. The registry is populated before the gateway starts serving
//! and is immutable afterwards, so it can be shared read-only across all
//! connections.
//!
//! The builtin set covers the decoders field-device protocols actually use:
//! bit expansion, fixed-width integers in both byte orders, IEEE floats,
//! ASCII, packed BCD and raw passthrough. Deployments with bespoke formats
//! register their own functions on top.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{GatewayError, Result};
use crate::types::Value;

/// A registered decode transform: one wire slice in, one or more values out.
///
/// An error aborts the current frame only; the owning connection is closed
/// and the error is logged with the referencing section's description.
pub type DecodeFn = Arc<dyn Fn(&[u8]) -> Result<Vec<Value>> + Send + Sync>;

/// Name-to-function table consulted by the protocol compiler.
pub struct DecodeRegistry {
    methods: HashMap<String, DecodeFn>,
}

impl DecodeRegistry {
    /// Empty registry, for deployments that supply every decoder themselves.
    pub fn new() -> Self {
        Self { methods: HashMap::new() }
    }

    /// Registry pre-populated with the stock decoder set.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register("bits8", |data: &[u8]| {
            let mut bits = Vec::with_capacity(data.len() * 8);
            for byte in data {
                for shift in (0..8).rev() {
                    bits.push(Value::UInt(u64::from((byte >> shift) & 1)));
                }
            }
            Ok(bits)
        });

        registry.register("u8", |data: &[u8]| {
            Ok(data.iter().map(|byte| Value::UInt(u64::from(*byte))).collect())
        });
        registry.register("i8", |data: &[u8]| {
            Ok(data.iter().map(|byte| Value::Int(i64::from(*byte as i8))).collect())
        });

        registry.register("u16_be", |data: &[u8]| {
            Ok(vec![Value::UInt(u64::from(u16::from_be_bytes(exact("u16_be", data)?)))])
        });
        registry.register("u16_le", |data: &[u8]| {
            Ok(vec![Value::UInt(u64::from(u16::from_le_bytes(exact("u16_le", data)?)))])
        });
        registry.register("i16_be", |data: &[u8]| {
            Ok(vec![Value::Int(i64::from(i16::from_be_bytes(exact("i16_be", data)?)))])
        });
        registry.register("i16_le", |data: &[u8]| {
            Ok(vec![Value::Int(i64::from(i16::from_le_bytes(exact("i16_le", data)?)))])
        });
        registry.register("u32_be", |data: &[u8]| {
            Ok(vec![Value::UInt(u64::from(u32::from_be_bytes(exact("u32_be", data)?)))])
        });
        registry.register("u32_le", |data: &[u8]| {
            Ok(vec![Value::UInt(u64::from(u32::from_le_bytes(exact("u32_le", data)?)))])
        });
        registry.register("i32_be", |data: &[u8]| {
            Ok(vec![Value::Int(i64::from(i32::from_be_bytes(exact("i32_be", data)?)))])
        });
        registry.register("i32_le", |data: &[u8]| {
            Ok(vec![Value::Int(i64::from(i32::from_le_bytes(exact("i32_le", data)?)))])
        });
        registry.register("f32_be", |data: &[u8]| {
            Ok(vec![Value::Float(f64::from(f32::from_be_bytes(exact("f32_be", data)?)))])
        });
        registry.register("f32_le", |data: &[u8]| {
            Ok(vec![Value::Float(f64::from(f32::from_le_bytes(exact("f32_le", data)?)))])
        });
        registry.register("f64_be", |data: &[u8]| {
            Ok(vec![Value::Float(f64::from_be_bytes(exact("f64_be", data)?))])
        });

        registry.register("ascii", |data: &[u8]| {
            let end = data.iter().position(|&byte| byte == 0).unwrap_or(data.len());
            Ok(vec![Value::Str(String::from_utf8_lossy(&data[..end]).trim().to_string())])
        });
        registry.register("hex", |data: &[u8]| {
            Ok(vec![Value::Str(data.iter().map(|byte| format!("{byte:02x}")).collect())])
        });
        registry.register("bcd", |data: &[u8]| {
            let mut acc: u64 = 0;
            for byte in data {
                let hi = u64::from(byte >> 4);
                let lo = u64::from(byte & 0x0F);
                if hi > 9 || lo > 9 {
                    return Err(GatewayError::TypeConversion {
                        details: format!("bcd: invalid nibble in byte {byte:#04x}"),
                    });
                }
                acc = acc * 100 + hi * 10 + lo;
            }
            Ok(vec![Value::UInt(acc)])
        });
        registry.register("bytes", |data: &[u8]| Ok(vec![Value::Bytes(data.to_vec())]));

        registry
    }

    /// Register a decode function under a name, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(&[u8]) -> Result<Vec<Value>> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(func));
    }

    /// Look up a decode function by name.
    pub fn get(&self, name: &str) -> Option<&DecodeFn> {
        self.methods.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered method names, sorted for stable diagnostics.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for DecodeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for DecodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeRegistry").field("methods", &self.method_names()).finish()
    }
}

fn exact<const N: usize>(method: &str, data: &[u8]) -> Result<[u8; N]> {
    <[u8; N]>::try_from(data).map_err(|_| GatewayError::TypeConversion {
        details: format!("{method} expects exactly {N} bytes, got {}", data.len()),
    })
}
