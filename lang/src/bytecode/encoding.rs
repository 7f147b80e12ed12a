//! Wire form of an [`Image`]: a 4-byte magic, a little-endian format
//! version, then the bincode payload.

use super::{Binding, FunctionIndex, Image, Op};

pub const MAGIC: [u8; 4] = *b"FLKR";
pub const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = MAGIC.len() + 2;
/// Upper bound on local slots in any one function.
pub const MAX_LOCALS: usize = 1 << 16;

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("image is empty")]
    Empty,
    #[error("image too short: {len} bytes")]
    Truncated { len: usize },
    #[error("bad magic: {found:?}")]
    BadMagic { found: [u8; 4] },
    #[error("unsupported format version {found}")]
    UnsupportedVersion { found: u16 },
    #[error("payload could not be decoded: {0}")]
    Payload(#[from] bincode::Error),
    #[error("in function {function}: {problem}")]
    Invalid { function: String, problem: String },
    #[error("entry point {0:?} does not exist")]
    BadEntry(FunctionIndex),
}

impl Image {
    pub fn encode(&self) -> Result<Vec<u8>, ImageError> {
        let payload = bincode::serialize(self)?;
        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Image, ImageError> {
        if bytes.is_empty() {
            return Err(ImageError::Empty);
        }
        if bytes.len() < HEADER_LEN {
            return Err(ImageError::Truncated { len: bytes.len() });
        }
        let (magic, rest) = bytes.split_at(MAGIC.len());
        if magic != MAGIC {
            let mut found = [0u8; 4];
            found.copy_from_slice(magic);
            return Err(ImageError::BadMagic { found });
        }
        let (version, payload) = rest.split_at(2);
        let version = u16::from_le_bytes([version[0], version[1]]);
        if version != FORMAT_VERSION {
            return Err(ImageError::UnsupportedVersion { found: version });
        }

        let image: Image = bincode::deserialize(payload)?;
        image.verify()?;
        Ok(image)
    }

    /// Checks every index and jump target so the interpreter never has to.
    pub fn verify(&self) -> Result<(), ImageError> {
        if let Some(entry) = self.entry {
            if self.functions.get(entry).is_none() {
                return Err(ImageError::BadEntry(entry));
            }
        }

        for ty in self.types.iter() {
            for idx in ty.initializer.iter().chain(ty.methods.iter()) {
                if self.functions.get(*idx).is_none() {
                    return Err(ImageError::Invalid {
                        function: ty.full_name(),
                        problem: format!("member refers to missing function {idx:?}"),
                    });
                }
            }
        }

        for function in self.functions.iter() {
            let invalid = |problem: String| ImageError::Invalid {
                function: function.name.clone(),
                problem,
            };

            if function.locals < function.arity {
                return Err(invalid(format!(
                    "{} locals cannot hold {} arguments",
                    function.locals, function.arity
                )));
            }
            if let Binding::Closure { captures } = function.binding {
                if captures > function.arity {
                    return Err(invalid(format!("{captures} captures exceed arity")));
                }
            }
            if let Some(owner) = function.owner {
                if self.types.get(owner).is_none() {
                    return Err(invalid(format!("owner {owner:?} does not exist")));
                }
            }

            let used = function
                .code
                .iter()
                .filter_map(|op| match op {
                    Op::Load(slot) | Op::Store(slot) | Op::IterNext { slot, .. } => Some(slot.saturating_add(1)),
                    _ => None,
                })
                .max()
                .unwrap_or(0);
            if function.locals > MAX_LOCALS {
                return Err(invalid(format!(
                    "{} locals exceed the limit of {MAX_LOCALS}",
                    function.locals
                )));
            }
            if function.locals > used.max(function.arity) {
                return Err(invalid(format!(
                    "{} locals but only {} are ever addressed",
                    function.locals,
                    used.max(function.arity)
                )));
            }

            let len = function.code.len();
            for op in function.code.iter() {
                let problem = match op {
                    Op::Load(slot) | Op::Store(slot) if *slot >= function.locals => {
                        Some(format!("local slot {slot} out of range"))
                    }
                    Op::IterNext { slot, .. } if *slot >= function.locals => {
                        Some(format!("iterator slot {slot} out of range"))
                    }
                    Op::Jump(target) | Op::JumpUnless(target) | Op::IterNext { exit: target, .. }
                        if *target > len =>
                    {
                        Some(format!("jump target {target} out of range"))
                    }
                    Op::Call { function: callee, .. } | Op::MakeClosure { function: callee, .. }
                        if self.functions.get(*callee).is_none() =>
                    {
                        Some(format!("call to missing function {callee:?}"))
                    }
                    Op::New(ty) if self.types.get(*ty).is_none() => {
                        Some(format!("construction of missing type {ty:?}"))
                    }
                    Op::CallNative { import, .. } if self.imports.get(*import).is_none() => {
                        Some(format!("missing import {import:?}"))
                    }
                    _ => None,
                };
                if let Some(problem) = problem {
                    return Err(invalid(problem));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Constant, Function, Visibility};

    fn tiny_image() -> Image {
        let mut image = Image {
            name: "unit".to_owned(),
            ..Image::default()
        };
        let main = image.functions.push_and_get_key(Function {
            name: "main".to_owned(),
            owner: None,
            visibility: Visibility::Public,
            binding: Binding::Static,
            arity: 1,
            locals: 1,
            code: vec![Op::Push(Constant::Unit), Op::Return],
        });
        image.entry = Some(main);
        image
    }

    #[test]
    fn encoded_image_starts_with_header() {
        let bytes = tiny_image().encode().unwrap();
        assert_eq!(&bytes[..4], b"FLKR");
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), FORMAT_VERSION);
        assert_eq!(Image::decode(&bytes).unwrap(), tiny_image());
    }

    #[test]
    fn rejects_foreign_bytes() {
        assert!(matches!(Image::decode(&[]), Err(ImageError::Empty)));
        assert!(matches!(
            Image::decode(b"MZ\x90\x00\x03\x00\x00\x00"),
            Err(ImageError::BadMagic { .. })
        ));
        let mut bytes = tiny_image().encode().unwrap();
        bytes[4] = 9;
        assert!(matches!(
            Image::decode(&bytes),
            Err(ImageError::UnsupportedVersion { found: 9 })
        ));
    }

    #[test]
    fn rejects_truncated_payload() {
        let bytes = tiny_image().encode().unwrap();
        assert!(matches!(
            Image::decode(&bytes[..bytes.len() - 3]),
            Err(ImageError::Payload(_))
        ));
    }

    #[test]
    fn rejects_unaddressed_locals() {
        let mut image = tiny_image();
        image.functions[FunctionIndex::from(0)].locals = usize::MAX / 2;
        let bytes = image.encode().unwrap();
        assert!(matches!(
            Image::decode(&bytes),
            Err(ImageError::Invalid { problem, .. }) if problem.contains("locals")
        ));

        let mut image = tiny_image();
        image.functions[FunctionIndex::from(0)].locals = 5;
        assert!(matches!(image.verify(), Err(ImageError::Invalid { .. })));

        // Slots past the arity are fine once code addresses them.
        let mut image = tiny_image();
        let main = &mut image.functions[FunctionIndex::from(0)];
        main.locals = 3;
        main.code.insert(0, Op::Store(2));
        main.code.insert(0, Op::Push(Constant::Int(1)));
        assert!(image.verify().is_ok());
    }

    #[test]
    fn rejects_jump_out_of_range() {
        let mut image = tiny_image();
        image.functions[FunctionIndex::from(0)].code.insert(0, Op::Jump(40));
        let bytes = image.encode().unwrap();
        assert!(matches!(
            Image::decode(&bytes),
            Err(ImageError::Invalid { .. })
        ));
    }
}
