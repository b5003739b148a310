//! Binary package: header, code, data, metadata and stack in one owned buffer.
//!
//! ```text
//! 0   mode u8, allocator u8, pad u8, flags u8
//! 4   code_size u16, stack_size u16 (slots)
//! 8   data_size u16 (bytes), package_size u16
//! 12  code_pointer i32, 16 data_start i32, 20 data_sizes_start i32
//! 24  data_offset i32 (stack start), 28 stack_offset i32 (slots in use)
//! 32  [code][pad 4][data][metadata: data + stack slots, pad 4][stack]
//! ```
//!
//! All fields are little endian. Offsets are absolute within the buffer;
//! `code_pointer` indexes the code.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bytecode::jumps::token_boundaries;
use crate::bytecode::op::{MAX_DATA_SLOTS, ScriptOp};
use crate::compiler::{CompilationData, CompileError, CompilerStage};
use crate::lang::variable::{DataType, Variable, slot_offsets};
use crate::runtime::{ExitStatus, Interpreter};

pub const HEADER_SIZE: usize = 32;

/// Fixed allocation sizes; the allocator tag of a package is the index of the
/// smallest class that holds it.
pub const CAPACITY_CLASSES: [usize; 15] = [
    32, 48, 64, 96, 128, 192, 256, 320, 384, 448, 512, 640, 768, 896, 960,
];

/// Allocator tag of packages that fit no capacity class.
pub const VARIABLE_ALLOCATION: u8 = 255;

/// Extra stack slots reserved for a yield frame.
pub const YIELD_STACK_SLOTS: usize = 5;

/// Stack slots of the provisional package used to estimate the stack size.
const ESTIMATION_STACK_SLOTS: u16 = 1024;

/// Resumes granted to a yielding script during the validation run.
const MAX_VALIDATION_RESUMES: usize = 64;

const FLAG_SUSPENDED: u8 = 0b1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum PackageMode {
    #[default]
    Normal = 0,
    /// Built by the compiler for its own validation run.
    Compiler = 1,
}

impl PackageMode {
    pub const fn from_byte(byte: u8) -> Option<PackageMode> {
        match byte {
            0 => Some(PackageMode::Normal),
            1 => Some(PackageMode::Compiler),
            _ => None,
        }
    }
}

/// Decoded package header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PackageHeader {
    pub mode: PackageMode,
    pub allocator: u8,
    pub flags: u8,
    pub code_size: u16,
    pub stack_size: u16,
    pub data_size: u16,
    pub package_size: u16,
    pub code_pointer: i32,
    pub data_start: i32,
    pub data_sizes_start: i32,
    pub data_offset: i32,
    pub stack_offset: i32,
}

impl PackageHeader {
    pub fn read(bytes: &[u8]) -> Option<PackageHeader> {
        let header = bytes.get(..HEADER_SIZE)?;
        let u16_at = |at: usize| u16::from_le_bytes([header[at], header[at + 1]]);
        let i32_at = |at: usize| {
            i32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]])
        };

        Some(PackageHeader {
            mode: PackageMode::from_byte(header[0])?,
            allocator: header[1],
            flags: header[3],
            code_size: u16_at(4),
            stack_size: u16_at(6),
            data_size: u16_at(8),
            package_size: u16_at(10),
            code_pointer: i32_at(12),
            data_start: i32_at(16),
            data_sizes_start: i32_at(20),
            data_offset: i32_at(24),
            stack_offset: i32_at(28),
        })
    }

    pub fn write(&self, bytes: &mut [u8]) {
        let Some(header) = bytes.get_mut(..HEADER_SIZE) else {
            return;
        };
        header[0] = self.mode as u8;
        header[1] = self.allocator;
        header[2] = 0;
        header[3] = self.flags;
        header[4..6].copy_from_slice(&self.code_size.to_le_bytes());
        header[6..8].copy_from_slice(&self.stack_size.to_le_bytes());
        header[8..10].copy_from_slice(&self.data_size.to_le_bytes());
        header[10..12].copy_from_slice(&self.package_size.to_le_bytes());
        header[12..16].copy_from_slice(&self.code_pointer.to_le_bytes());
        header[16..20].copy_from_slice(&self.data_start.to_le_bytes());
        header[20..24].copy_from_slice(&self.data_sizes_start.to_le_bytes());
        header[24..28].copy_from_slice(&self.data_offset.to_le_bytes());
        header[28..32].copy_from_slice(&self.stack_offset.to_le_bytes());
    }

    pub fn is_suspended(&self) -> bool {
        self.flags & FLAG_SUSPENDED != 0
    }

    pub fn set_suspended(&mut self, suspended: bool) {
        if suspended {
            self.flags |= FLAG_SUSPENDED;
        } else {
            self.flags &= !FLAG_SUSPENDED;
        }
    }

    pub fn data_slots(&self) -> usize {
        self.data_size as usize / 4
    }

    /// Checks that every region lies inside a buffer of `len` bytes.
    fn is_consistent(&self, len: usize) -> bool {
        let code_end = HEADER_SIZE + self.code_size as usize;
        let data_start = self.data_start as usize;
        let meta_start = self.data_sizes_start as usize;
        let stack_start = self.data_offset as usize;
        let slots = self.data_slots() + self.stack_size as usize;

        self.data_start >= 0
            && self.data_sizes_start >= 0
            && self.data_offset >= 0
            && self.stack_offset >= 0
            && self.package_size as usize == len
            && code_end <= data_start
            && data_start + self.data_size as usize <= meta_start
            && meta_start + slots <= stack_start
            && stack_start + 4 * self.stack_size as usize <= len
    }
}

/// Metadata byte of a slot: `(vector_size & 0xF) | (type << 4)`.
pub const fn encode_metadata(vector_size: u8, data_type: DataType) -> u8 {
    (vector_size & 0xF) | ((data_type as u8) << 4)
}

/// Vector size and type of a metadata byte; the type is `None` for unknown bits.
pub const fn decode_metadata(byte: u8) -> (u8, Option<DataType>) {
    (byte & 0xF, DataType::from_bits(byte >> 4))
}

const fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Allocator tag for a package of `size` bytes.
pub fn allocator_tag(size: usize) -> u8 {
    CAPACITY_CLASSES
        .iter()
        .position(|class| size <= *class)
        .map_or(VARIABLE_ALLOCATION, |i| i as u8)
}

/// Mutable view on the data, metadata and stack regions of a package.
pub struct Memory<'p> {
    pub data: &'p mut [u8],
    /// One byte per data slot followed by one byte per stack slot.
    pub metadata: &'p mut [u8],
    pub stack: &'p mut [u8],
}

impl Memory<'_> {
    pub fn data_slots(&self) -> usize {
        self.data.len() / 4
    }

    pub fn stack_slots(&self) -> usize {
        self.stack.len() / 4
    }

    pub fn data_value(&self, slot: usize) -> Option<f32> {
        read_f32(&*self.data, slot)
    }

    pub fn set_data_value(&mut self, slot: usize, value: f32) -> Option<()> {
        write_f32(self.data, slot, value)
    }

    pub fn data_metadata(&self, slot: usize) -> Option<u8> {
        self.metadata.get(slot).copied()
    }

    pub fn stack_value(&self, slot: usize) -> Option<f32> {
        read_f32(&*self.stack, slot)
    }

    pub fn set_stack_value(&mut self, slot: usize, value: f32) -> Option<()> {
        write_f32(self.stack, slot, value)
    }

    pub fn stack_metadata(&self, slot: usize) -> Option<u8> {
        let data_slots = self.data_slots();
        self.metadata.get(data_slots + slot).copied()
    }

    pub fn set_stack_metadata(&mut self, slot: usize, byte: u8) -> Option<()> {
        let data_slots = self.data_slots();
        *self.metadata.get_mut(data_slots + slot)? = byte;
        Some(())
    }
}

fn read_f32(buffer: &[u8], slot: usize) -> Option<f32> {
    let bytes = buffer.get(slot * 4..slot * 4 + 4)?;
    Some(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn write_f32(buffer: &mut [u8], slot: usize, value: f32) -> Option<()> {
    buffer
        .get_mut(slot * 4..slot * 4 + 4)?
        .copy_from_slice(&value.to_le_bytes());
    Some(())
}

/// An executable package.
///
/// The package owns its buffer; interpreters borrow it for one execution and
/// write back the header state they need to resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    bytes: Vec<u8>,
}

impl Package {
    /// Lays out `code` and the data of `variables` with `stack_slots` of stack.
    pub fn build(
        code: &[u8],
        variables: &[Variable],
        stack_slots: u16,
        mode: PackageMode,
    ) -> Result<Package, CompileError> {
        let data_slots: usize = variables.iter().map(|v| v.vector_size.max(1) as usize).sum();
        if data_slots > MAX_DATA_SLOTS {
            return Err(CompileError::capacity(format!(
                "{} data slots, at most {} are addressable",
                data_slots, MAX_DATA_SLOTS
            )));
        }
        let stack = stack_slots as usize;

        let data_start = align4(HEADER_SIZE + code.len());
        let meta_start = data_start + 4 * data_slots;
        let stack_start = align4(meta_start + data_slots + stack);
        let size = stack_start + 4 * stack;

        let fit = |what: &str, n: usize| {
            u16::try_from(n).map_err(|_| {
                CompileError::capacity(format!("{} of {} bytes does not fit the header", what, n))
            })
        };

        let header = PackageHeader {
            mode,
            allocator: allocator_tag(size),
            flags: 0,
            code_size: fit("code", code.len())?,
            stack_size: stack_slots,
            data_size: fit("data", 4 * data_slots)?,
            package_size: fit("package", size)?,
            code_pointer: 0,
            data_start: data_start as i32,
            data_sizes_start: meta_start as i32,
            data_offset: stack_start as i32,
            stack_offset: 0,
        };

        let mut bytes = vec![0u8; size];
        header.write(&mut bytes);
        bytes[HEADER_SIZE..HEADER_SIZE + code.len()].copy_from_slice(code);

        let offsets = slot_offsets(variables);
        for (variable, offset) in variables.iter().zip(offsets) {
            let size = variable.vector_size.max(1);
            let meta = encode_metadata(size, variable.data_type);
            for lane in 0..size as usize {
                let slot = offset + lane;
                bytes[meta_start + slot] = meta;
                if let Some(value) = &variable.value {
                    let x = value.lanes[lane].to_le_bytes();
                    let at = data_start + 4 * slot;
                    bytes[at..at + 4].copy_from_slice(&x);
                }
            }
        }

        Ok(Package { bytes })
    }

    /// Wraps raw bytes after checking the header.
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Package> {
        let header = PackageHeader::read(&bytes)?;
        header.is_consistent(bytes.len()).then_some(Package { bytes })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn header(&self) -> Option<PackageHeader> {
        PackageHeader::read(&self.bytes)
    }

    pub fn set_header(&mut self, header: &PackageHeader) {
        header.write(&mut self.bytes);
    }

    pub fn is_suspended(&self) -> bool {
        self.header().is_some_and(|h| h.is_suspended())
    }

    pub fn code(&self) -> &[u8] {
        match self.header() {
            Some(h) => self
                .bytes
                .get(HEADER_SIZE..HEADER_SIZE + h.code_size as usize)
                .unwrap_or_default(),
            None => &[],
        }
    }

    /// Code plus mutable memory regions; `None` for an inconsistent header.
    pub fn split_mut(&mut self) -> Option<(&[u8], Memory<'_>)> {
        let header = self.header()?;
        if !header.is_consistent(self.bytes.len()) {
            return None;
        }
        let data_slots = header.data_slots();
        let slots = data_slots + header.stack_size as usize;

        let (head, rest) = self.bytes.split_at_mut(header.data_start as usize);
        let code = &head[HEADER_SIZE..HEADER_SIZE + header.code_size as usize];

        let (data, rest) = rest.split_at_mut((header.data_sizes_start - header.data_start) as usize);
        let data = &mut data[..header.data_size as usize];

        let (metadata, stack) = rest.split_at_mut((header.data_offset - header.data_sizes_start) as usize);
        let metadata = &mut metadata[..slots];
        let stack = &mut stack[..4 * header.stack_size as usize];

        Some((code, Memory { data, metadata, stack }))
    }

    pub fn data_slots(&self) -> usize {
        self.header().map_or(0, |h| h.data_slots())
    }

    pub fn read_slot(&self, slot: usize) -> Option<f32> {
        let header = self.header()?;
        if slot >= header.data_slots() {
            return None;
        }
        read_f32(&self.bytes[header.data_start as usize..], slot)
    }

    pub fn write_slot(&mut self, slot: usize, value: f32) -> Option<()> {
        let header = self.header()?;
        if slot >= header.data_slots() {
            return None;
        }
        write_f32(&mut self.bytes[header.data_start as usize..], slot, value)
    }

    /// Metadata byte of data slot `slot`.
    pub fn slot_metadata(&self, slot: usize) -> Option<u8> {
        let header = self.header()?;
        if slot >= header.data_slots() {
            return None;
        }
        self.bytes.get(header.data_sizes_start as usize + slot).copied()
    }

    /// Number of stack slots in use.
    pub fn stack_offset(&self) -> usize {
        self.header().map_or(0, |h| h.stack_offset.max(0) as usize)
    }
}

// =============================================================================
// Packaging stage
// =============================================================================

/// Sizes the stack, lays out the package and optionally validates it.
pub struct Packager;

impl CompilerStage for Packager {
    fn name(&self) -> &'static str {
        "package"
    }

    fn execute(&self, data: &mut CompilationData<'_>) -> Result<(), CompileError> {
        let has_yield = token_boundaries(&data.bytecode)
            .iter()
            .any(|p| data.bytecode[*p] == ScriptOp::Yield.byte());

        let run = if data.options.estimate_stack_size || data.options.auto_validate {
            Some(validation_run(data)?)
        } else {
            None
        };

        if data.options.auto_validate
            && let Some((_, status)) = run
            && status.is_error()
        {
            return Err(CompileError::Validation {
                code: status.code(),
                message: status.to_string(),
            });
        }

        let stack_slots = match data.defines.get("stack_size") {
            Some(value) => value.trim().parse::<u16>().map_err(|_| {
                CompileError::capacity(format!("invalid stack_size '{}'", value))
            })?,
            None => {
                let mut slots = data.options.default_stack_size as usize;
                if data.options.estimate_stack_size
                    && let Some((max_values, _)) = run
                {
                    slots = slots.max(4 * max_values);
                }
                if has_yield {
                    slots += YIELD_STACK_SLOTS;
                }
                u16::try_from(slots).map_err(|_| {
                    CompileError::capacity(format!("{} stack slots do not fit the header", slots))
                })?
            }
        };

        let package = Package::build(
            &data.bytecode,
            &data.variables,
            stack_slots,
            data.options.package_mode,
        )?;
        debug!(
            size = package.bytes().len(),
            stack_slots,
            has_yield,
            allocator = package.header().map_or(VARIABLE_ALLOCATION, |h| h.allocator),
            "packaged"
        );
        data.package = Some(package);
        Ok(())
    }
}

/// Runs the code once in validation mode on a roomy provisional package and
/// returns the most values seen on the stack and the final status.
fn validation_run(data: &CompilationData<'_>) -> Result<(usize, ExitStatus), CompileError> {
    let mut package = Package::build(
        &data.bytecode,
        &data.variables,
        ESTIMATION_STACK_SLOTS,
        PackageMode::Compiler,
    )?;
    let mut interpreter = Interpreter::new(data.engine).validation_mode(true);

    let mut status = interpreter.execute(&mut package);
    let mut resumes = 0;
    while status == ExitStatus::Yield && resumes < MAX_VALIDATION_RESUMES {
        status = interpreter.resume(&mut package);
        resumes += 1;
    }
    if status.is_error() {
        warn!(%status, "validation run did not complete");
    }
    debug!(max_values = interpreter.max_stack_values(), %status, "validation run");
    Ok((interpreter.max_stack_values(), status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{Compiler, CompilerOptions};
    use crate::engine::Engine;
    use crate::lang::value::Value;

    fn package(source: &str, options: &CompilerOptions) -> Package {
        let engine = Engine::new();
        let data = Compiler::new(&engine).compile_job(source, options).unwrap();
        data.package.unwrap()
    }

    #[test]
    fn test_header_layout() {
        let p = package("a = 1 2 3; b = a.y;", &CompilerOptions::default());
        let h = p.header().unwrap();
        assert_eq!(h.mode, PackageMode::Normal);
        assert_eq!(h.data_size, 16);
        assert_eq!(h.data_start as usize, align4(HEADER_SIZE + h.code_size as usize));
        assert_eq!(h.data_sizes_start, h.data_start + 16);
        assert_eq!(h.data_offset % 4, 0);
        assert_eq!(h.package_size as usize, p.bytes().len());
        assert_eq!(h.stack_size, 16);
        assert_eq!(h.allocator, allocator_tag(p.bytes().len()));
        assert_eq!(p.code()[0], ScriptOp::Assign.byte());
    }

    #[test]
    fn test_metadata_per_slot() {
        let p = package("a = 1 2 3; b = a.y;", &CompilerOptions::default());
        for slot in 0..3 {
            assert_eq!(decode_metadata(p.slot_metadata(slot).unwrap()), (3, Some(DataType::Numeric)));
        }
        assert_eq!(decode_metadata(p.slot_metadata(3).unwrap()).0, 1);
        assert!(p.slot_metadata(4).is_none());
    }

    #[test]
    fn test_yield_reserves_frame() {
        let options = CompilerOptions {
            estimate_stack_size: false,
            ..CompilerOptions::default()
        };
        let p = package("yield 2;", &options);
        assert_eq!(p.header().unwrap().stack_size as usize, 16 + YIELD_STACK_SLOTS);
    }

    #[test]
    fn test_stack_size_define_wins() {
        let p = package("#define stack_size 40\npush(1); a = pop;", &CompilerOptions::default());
        assert_eq!(p.header().unwrap().stack_size, 40);

        let engine = Engine::new();
        let failure = Compiler::new(&engine)
            .compile("a = 1;", &CompilerOptions::default().with_define("stack_size", "lots"))
            .unwrap_err();
        assert!(matches!(failure.error, CompileError::PackagingCapacityFailure { .. }));
    }

    #[test]
    fn test_estimate_grows_with_pushes() {
        let source = "push(1); push(2); push(3); push(4); push(5); a = pop + pop + pop + pop + pop;";
        let p = package(source, &CompilerOptions::default());
        assert_eq!(p.header().unwrap().stack_size, 20);
    }

    #[test]
    fn test_capacity_classes() {
        assert_eq!(allocator_tag(10), 0);
        assert_eq!(allocator_tag(33), 1);
        assert_eq!(allocator_tag(960), 14);
        assert_eq!(allocator_tag(961), VARIABLE_ALLOCATION);
    }

    #[test]
    fn test_constants_are_stored() {
        let mut variables = vec![Variable::constant(0, Value::from_slice(&[1.5, 2.5]))];
        variables.push(Variable::new(1, "x"));
        variables[1].vector_size = 1;
        let mut p = Package::build(&[0], &variables, 4, PackageMode::Compiler).unwrap();
        assert_eq!(p.read_slot(1), Some(2.5));
        p.write_slot(2, 7.0).unwrap();
        assert_eq!(p.read_slot(2), Some(7.0));
        assert!(p.read_slot(3).is_none());

        let (code, memory) = p.split_mut().unwrap();
        assert_eq!(code, &[0]);
        assert_eq!(memory.data_slots(), 3);
        assert_eq!(memory.stack_slots(), 4);
        assert_eq!(memory.stack_metadata(0), Some(0));
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(Package::from_bytes(vec![0; 8]).is_none());
        let p = package("a = 2;", &CompilerOptions::default());
        let mut bytes = p.bytes().to_vec();
        assert_eq!(Package::from_bytes(bytes.clone()), Some(p));
        bytes.pop();
        assert!(Package::from_bytes(bytes).is_none());
    }
}
