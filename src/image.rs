//! Program images: serialized class definitions plus an optional entry
//! point, read from TOML or JSON.
//!
//! ```toml
//! entry = "demo/Main.main:()V"
//!
//! [[classes]]
//! name = "demo/Main"
//! flags = ["public"]
//! constants = [{ methodref = ["kettle/Console", "println", "(I)V"] }]
//!
//! [[classes.methods]]
//! name = "main"
//! descriptor = "()V"
//! flags = ["public", "static"]
//! max_stack = 1
//! code = [{ iconst = 42 }, { invokestatic = 1 }, "return"]
//! ```

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ImageError, VmError};
use crate::vm::bootstrap::names;
use crate::vm::bytecode;
use crate::vm::class::{ClassDef, MethodDef};
use crate::vm::descriptor::{FieldType, MethodDescriptor};
use crate::vm::exception::Trap;
use crate::vm::registry::ClassLoader;
use crate::vm::{Thread, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProgramImage {
    /// `Class.method` or `Class.method:descriptor`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    #[serde(default)]
    pub classes: Vec<ClassDef>,
}

impl ProgramImage {
    pub fn from_toml(text: &str) -> Result<Self, ImageError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ImageError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Read an image, choosing the format by extension (`.json`, else TOML).
    pub fn load(path: &Path) -> Result<Self, ImageError> {
        let text = fs::read_to_string(path).map_err(|source| ImageError::Read {
            path: path.display().to_string(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&text),
            _ => Self::from_toml(&text),
        }
    }
}

/// A resolved entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub class: String,
    pub method: String,
    pub descriptor: String,
}

/// Serves the classes of one program image.
#[derive(Debug, Clone, Default)]
pub struct ImageLoader {
    classes: HashMap<String, ClassDef>,
    entry: Option<String>,
}

impl ImageLoader {
    /// Index an image, decoding raw bytecode bodies.
    pub fn new(image: ProgramImage) -> Result<Self, ImageError> {
        let mut classes = HashMap::with_capacity(image.classes.len());
        for def in image.classes {
            let def = normalize(def)?;
            if classes.contains_key(&def.name) {
                return Err(ImageError::Duplicate(def.name));
            }
            classes.insert(def.name.clone(), def);
        }
        tracing::debug!(classes = classes.len(), "image indexed");
        Ok(Self {
            classes,
            entry: image.entry,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ImageError> {
        Self::new(ProgramImage::load(path)?)
    }

    /// Class names in sorted order.
    pub fn class_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.classes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn class(&self, name: &str) -> Option<&ClassDef> {
        self.classes.get(name)
    }

    pub fn entry(&self) -> Option<&str> {
        self.entry.as_deref()
    }

    /// Resolve `Class.method[:descriptor]`. Dots in the class part are
    /// accepted. Without a descriptor the class must declare exactly one
    /// static method of that name.
    pub fn resolve_entry(&self, spec: &str) -> Result<EntryPoint, ImageError> {
        let invalid = || ImageError::Entry(spec.to_string());
        let (path, descriptor) = match spec.split_once(':') {
            Some((path, descriptor)) => (path, Some(descriptor)),
            None => (spec, None),
        };
        let (class, method) = path.rsplit_once('.').ok_or_else(invalid)?;
        if class.is_empty() || method.is_empty() {
            return Err(invalid());
        }
        let class = class.replace('.', "/");

        let descriptor = match descriptor {
            Some(d) => {
                MethodDescriptor::parse(d).map_err(|_| invalid())?;
                d.to_string()
            }
            None => {
                let def = self.classes.get(&class).ok_or_else(invalid)?;
                let mut candidates = def
                    .methods
                    .iter()
                    .filter(|m| m.name == method && m.flags.contains(crate::vm::AccessFlags::STATIC));
                match (candidates.next(), candidates.next()) {
                    (Some(m), None) => m.descriptor.clone(),
                    _ => return Err(invalid()),
                }
            }
        };
        Ok(EntryPoint {
            class,
            method: method.to_string(),
            descriptor,
        })
    }
}

impl ClassLoader for ImageLoader {
    fn find_class(&self, name: &str) -> Option<ClassDef> {
        self.classes.get(name).cloned()
    }
}

/// Replace raw `bytecode` with decoded instructions, translating handler
/// and line positions from byte offsets to instruction indices.
fn normalize(mut def: ClassDef) -> Result<ClassDef, ImageError> {
    let class = def.name.clone();
    for method in &mut def.methods {
        let Some(bytes) = method.bytecode.take() else {
            continue;
        };
        let method_name = format!("{}{}", method.name, method.descriptor);
        if !method.code.is_empty() {
            return Err(ImageError::Class {
                class,
                message: format!("method {} has both code and bytecode", method_name),
            });
        }
        let decoded = bytecode::decode(&bytes).map_err(|source| ImageError::Bytecode {
            class: class.clone(),
            method: method_name.clone(),
            source,
        })?;
        let index = |offset: usize| {
            decoded.index_of(offset).ok_or_else(|| ImageError::Class {
                class: class.clone(),
                message: format!(
                    "method {}: offset {} is not an instruction boundary",
                    method_name, offset
                ),
            })
        };
        for handler in &mut method.handlers {
            handler.start = index(handler.start)?;
            handler.end = index(handler.end)?;
            handler.handler = index(handler.handler)?;
        }
        for (pc, _) in &mut method.lines {
            *pc = index(*pc)?;
        }
        method.code = decoded.instructions;
    }
    Ok(def)
}

// ========================================
// Host arguments
// ========================================

fn host_error(ty: &FieldType, value: &str) -> VmError {
    VmError::HostArgument {
        ty: ty.to_string(),
        value: value.to_string(),
    }
}

/// Trap from allocating a host argument; only heap exhaustion can throw.
fn allocation_error(trap: Trap) -> VmError {
    match trap {
        Trap::Fatal(e) => e,
        Trap::Throw(_) => VmError::OutOfMemory("host arguments".to_string()),
    }
}

/// One command-line argument as a value of parameter type `ty`.
pub fn host_value(thread: &mut Thread, ty: &FieldType, raw: &str) -> Result<Value, VmError> {
    let value = match ty {
        FieldType::Boolean => match raw {
            "true" | "1" => Value::Int(1),
            "false" | "0" => Value::Int(0),
            _ => return Err(host_error(ty, raw)),
        },
        FieldType::Char => {
            let mut units = raw.encode_utf16();
            match (units.next(), units.next()) {
                (Some(unit), None) => Value::Int(unit as i32),
                _ => return Err(host_error(ty, raw)),
            }
        }
        FieldType::Byte | FieldType::Short | FieldType::Int => {
            let n: i32 = raw.parse().map_err(|_| host_error(ty, raw))?;
            ty.kind().narrow(Value::Int(n))
        }
        FieldType::Long => Value::Long(raw.parse().map_err(|_| host_error(ty, raw))?),
        FieldType::Float => Value::Float(raw.parse().map_err(|_| host_error(ty, raw))?),
        FieldType::Double => Value::Double(raw.parse().map_err(|_| host_error(ty, raw))?),
        FieldType::Object(name) if name == names::STRING => {
            Value::Ref(Some(thread.new_string(raw).map_err(allocation_error)?))
        }
        _ => return Err(host_error(ty, raw)),
    };
    Ok(value)
}

/// Arguments for an entry point. A single `String[]` parameter receives
/// every argument; otherwise arguments map one-to-one onto parameters.
pub fn host_args(
    thread: &mut Thread,
    descriptor: &MethodDescriptor,
    raw: &[String],
) -> Result<Vec<Value>, VmError> {
    let string_array = FieldType::Array(Box::new(FieldType::Object(names::STRING.to_string())));
    if descriptor.params == [string_array.clone()] {
        let vm = std::sync::Arc::clone(thread.vm());
        let class = vm
            .registry()
            .array_of(&FieldType::Object(names::STRING.to_string()))
            .map_err(|e| VmError::BootstrapClass {
                class: string_array.to_string(),
                message: e.to_string(),
            })?;
        let array = thread.new_array(&class, raw.len()).map_err(allocation_error)?;
        for (i, arg) in raw.iter().enumerate() {
            let text = thread.new_string(arg).map_err(allocation_error)?;
            vm.heap().write_element(array, i, Value::Ref(Some(text)))?;
        }
        return Ok(vec![Value::Ref(Some(array))]);
    }

    if descriptor.params.len() != raw.len() {
        return Err(VmError::ArgumentCount {
            method: descriptor.to_string(),
            expected: descriptor.params.len(),
            found: raw.len(),
        });
    }
    descriptor
        .params
        .iter()
        .zip(raw)
        .map(|(ty, arg)| host_value(thread, ty, arg))
        .collect()
}

// ========================================
// Disassembly
// ========================================

fn disassemble_method(out: &mut String, method: &MethodDef) {
    let flags: Vec<crate::vm::Flag> = method.flags.into();
    let flags: Vec<String> = flags.iter().map(|f| format!("{:?}", f).to_lowercase()).collect();
    let _ = writeln!(
        out,
        "  {}{} [{}] stack={} locals={}",
        method.name,
        method.descriptor,
        flags.join(" "),
        method.max_stack,
        method.max_locals
    );
    for (pc, insn) in method.code.iter().enumerate() {
        let line = method
            .lines
            .iter()
            .find(|(start, _)| *start == pc)
            .map(|(_, line)| format!("  // line {}", line))
            .unwrap_or_default();
        let _ = writeln!(out, "    {:4}: {:?}{}", pc, insn, line);
    }
    for handler in &method.handlers {
        let _ = writeln!(
            out,
            "    catch {} [{}, {}) -> {}",
            handler.catch_type.as_deref().unwrap_or("any"),
            handler.start,
            handler.end,
            handler.handler
        );
    }
}

/// Human-readable listing of a class's constant pool and methods.
pub fn disassemble(def: &ClassDef) -> String {
    let mut out = String::new();
    let _ = write!(out, "class {}", def.name);
    if let Some(super_class) = &def.super_class {
        let _ = write!(out, " extends {}", super_class);
    }
    if !def.interfaces.is_empty() {
        let _ = write!(out, " implements {}", def.interfaces.join(", "));
    }
    out.push('\n');
    for (i, constant) in def.constants.iter().enumerate() {
        let _ = writeln!(out, "  #{} = {:?}", i + 1, constant);
    }
    for field in &def.fields {
        let _ = writeln!(out, "  field {} {}", field.name, field.descriptor);
    }
    for method in &def.methods {
        disassemble_method(&mut out, method);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::ops::Instruction;

    const IMAGE: &str = r#"
entry = "demo/Main.main"

[[classes]]
name = "demo/Main"
flags = ["public"]
constants = [{ methodref = ["kettle/Console", "println", "(I)V"] }]

[[classes.methods]]
name = "main"
descriptor = "()V"
flags = ["public", "static"]
max_stack = 1
code = [{ iconst = 42 }, { invokestatic = 1 }, "return"]
"#;

    #[test]
    fn test_parse_toml_image() {
        let image = ProgramImage::from_toml(IMAGE).unwrap();
        assert_eq!(image.entry.as_deref(), Some("demo/Main.main"));
        let main = &image.classes[0].methods[0];
        assert_eq!(
            main.code,
            vec![Instruction::Iconst(42), Instruction::Invokestatic(1), Instruction::Return]
        );
    }

    #[test]
    fn test_parse_json_image() {
        let json = r#"{"classes": [{"name": "demo/A", "methods": [
            {"name": "f", "descriptor": "()I", "flags": ["static"], "max_stack": 1,
             "code": [{"iconst": 1}, "ireturn"]}]}]}"#;
        let loader = ImageLoader::new(ProgramImage::from_json(json).unwrap()).unwrap();
        assert_eq!(loader.class_names(), vec!["demo/A"]);
        assert!(loader.find_class("demo/A").is_some());
        assert!(loader.find_class("demo/B").is_none());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        assert!(ProgramImage::from_toml("entri = \"x\"").is_err());
    }

    #[test]
    fn test_bytecode_is_decoded_and_handlers_remapped() {
        let mut def = ClassDef {
            name: "demo/B".to_string(),
            ..Default::default()
        };
        // iconst_1, iconst_0, idiv, ireturn, astore_0 (handler), iconst_m1, ireturn
        def.methods.push(MethodDef {
            name: "f".to_string(),
            descriptor: "()I".to_string(),
            bytecode: Some(vec![0x04, 0x03, 0x6c, 0xac, 0x4b, 0x02, 0xac]),
            handlers: vec![crate::vm::class::HandlerDef {
                start: 0,
                end: 3,
                handler: 4,
                catch_type: None,
            }],
            lines: vec![(0, 10), (4, 11)],
            ..Default::default()
        });
        let def = normalize(def).unwrap();
        let method = &def.methods[0];
        assert_eq!(method.code.len(), 7);
        assert!(method.bytecode.is_none());
        assert_eq!(method.handlers[0].handler, 4);
        assert_eq!(method.lines, vec![(0, 10), (4, 11)]);
    }

    #[test]
    fn test_code_and_bytecode_conflict() {
        let mut def = ClassDef {
            name: "demo/C".to_string(),
            ..Default::default()
        };
        def.methods.push(MethodDef {
            name: "f".to_string(),
            descriptor: "()V".to_string(),
            code: vec![Instruction::Return],
            bytecode: Some(vec![0xb1]),
            ..Default::default()
        });
        assert!(matches!(normalize(def), Err(ImageError::Class { .. })));
    }

    #[test]
    fn test_duplicate_classes_rejected() {
        let def = ClassDef {
            name: "demo/D".to_string(),
            ..Default::default()
        };
        let image = ProgramImage {
            entry: None,
            classes: vec![def.clone(), def],
        };
        assert!(matches!(ImageLoader::new(image), Err(ImageError::Duplicate(_))));
    }

    #[test]
    fn test_resolve_entry() {
        let loader = ImageLoader::new(ProgramImage::from_toml(IMAGE).unwrap()).unwrap();
        let entry = loader.resolve_entry("demo.Main.main").unwrap();
        assert_eq!(
            entry,
            EntryPoint {
                class: "demo/Main".to_string(),
                method: "main".to_string(),
                descriptor: "()V".to_string(),
            }
        );
        let explicit = loader.resolve_entry("demo/Main.run:(I)I").unwrap();
        assert_eq!(explicit.descriptor, "(I)I");
        assert!(loader.resolve_entry("nomethod").is_err());
        assert!(loader.resolve_entry("demo/Main.missing").is_err());
        assert!(loader.resolve_entry("demo/Main.main:(bad").is_err());
    }

    #[test]
    fn test_disassemble_lists_code() {
        let image = ProgramImage::from_toml(IMAGE).unwrap();
        let text = disassemble(&image.classes[0]);
        assert!(text.starts_with("class demo/Main"));
        assert!(text.contains("#1 = Methodref"));
        assert!(text.contains("main()V [public static]"));
        assert!(text.contains("Iconst(42)"));
    }
}
