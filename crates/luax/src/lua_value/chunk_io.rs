// Chunk files: the external compiler hands us prototypes serialized as
// JSON; this module turns them into runtime `Prototype` trees.
// Available behind the `serde` feature.

use super::{Constant, LocalVar, Prototype, UpvalueDesc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum ConstantData {
    Nil,
    Boolean(bool),
    Number(f64),
    String(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpvalueData {
    pub name: String,
    pub in_stack: bool,
    pub index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalData {
    pub name: String,
    pub start_pc: u32,
    pub end_pc: u32,
}

/// Serialized prototype tree, field-for-field with [`Prototype`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkData {
    pub chunk_name: String,
    pub code: Vec<u32>,
    #[serde(default)]
    pub line_info: Vec<u32>,
    #[serde(default)]
    pub constants: Vec<ConstantData>,
    #[serde(default)]
    pub protos: Vec<ChunkData>,
    #[serde(default)]
    pub upvalues: Vec<UpvalueData>,
    #[serde(default)]
    pub locals: Vec<LocalData>,
    #[serde(default)]
    pub param_count: usize,
    #[serde(default)]
    pub is_vararg: bool,
    pub max_stack_size: usize,
    #[serde(default)]
    pub line_defined: u32,
    #[serde(default)]
    pub last_line_defined: u32,
}

/// Chunk names use `/` separators regardless of the producing platform
fn normalize_chunk_name(name: &str) -> String {
    name.replace('\\', "/")
}

impl ChunkData {
    pub fn into_prototype(self) -> Arc<Prototype> {
        let constants = self
            .constants
            .into_iter()
            .map(|k| match k {
                ConstantData::Nil => Constant::Nil,
                ConstantData::Boolean(b) => Constant::Boolean(b),
                ConstantData::Number(n) => Constant::Number(n),
                ConstantData::String(s) => Constant::String(s),
            })
            .collect();
        let protos = self
            .protos
            .into_iter()
            .map(ChunkData::into_prototype)
            .collect();
        let upvalues = self
            .upvalues
            .into_iter()
            .map(|u| UpvalueDesc {
                name: SmolStr::new(&u.name),
                in_stack: u.in_stack,
                index: u.index,
            })
            .collect();
        let locals = self
            .locals
            .into_iter()
            .map(|l| LocalVar {
                name: SmolStr::new(&l.name),
                start_pc: l.start_pc,
                end_pc: l.end_pc,
            })
            .collect();
        let mut proto = Prototype::new(
            normalize_chunk_name(&self.chunk_name),
            self.code,
            self.line_info,
            constants,
            protos,
            upvalues,
            locals,
            self.param_count,
            self.is_vararg,
            self.max_stack_size,
        );
        proto.line_defined = self.line_defined;
        proto.last_line_defined = self.last_line_defined;
        Arc::new(proto)
    }

    pub fn from_prototype(proto: &Prototype) -> ChunkData {
        ChunkData {
            chunk_name: proto.chunk_name.to_string(),
            code: proto.code_snapshot(),
            line_info: proto.line_info.clone(),
            constants: proto
                .constants
                .iter()
                .map(|k| match k {
                    Constant::Nil => ConstantData::Nil,
                    Constant::Boolean(b) => ConstantData::Boolean(*b),
                    Constant::Number(n) => ConstantData::Number(*n),
                    Constant::String(s) => ConstantData::String(s.clone()),
                })
                .collect(),
            protos: proto
                .protos
                .iter()
                .map(|p| ChunkData::from_prototype(p))
                .collect(),
            upvalues: proto
                .upvalues
                .iter()
                .map(|u| UpvalueData {
                    name: u.name.to_string(),
                    in_stack: u.in_stack,
                    index: u.index,
                })
                .collect(),
            locals: proto
                .locals
                .iter()
                .map(|l| LocalData {
                    name: l.name.to_string(),
                    start_pc: l.start_pc,
                    end_pc: l.end_pc,
                })
                .collect(),
            param_count: proto.param_count,
            is_vararg: proto.is_vararg,
            max_stack_size: proto.max_stack_size,
            line_defined: proto.line_defined,
            last_line_defined: proto.last_line_defined,
        }
    }
}

pub fn parse_chunk(json: &str) -> Result<Arc<Prototype>, String> {
    let data: ChunkData =
        serde_json::from_str(json).map_err(|e| format!("malformed chunk: {}", e))?;
    Ok(data.into_prototype())
}

pub fn load_chunk_file(path: &Path) -> Result<Arc<Prototype>, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read chunk file {}: {}", path.display(), e))?;
    parse_chunk(&text)
}

pub fn chunk_to_json(proto: &Prototype) -> Result<String, String> {
    serde_json::to_string_pretty(&ChunkData::from_prototype(proto))
        .map_err(|e| format!("cannot serialize chunk: {}", e))
}
