// Function prototype: the compiled-function object the collector
// traverses. Produced by the bytecode compiler (an external collaborator),
// consumed here for its reference graph only.

use super::LoamValue;
use crate::gc::GcRef;

pub struct LoamProto {
    /// Name of the source the prototype was compiled from (a string value)
    pub source: LoamValue,
    /// Constant pool
    pub constants: Vec<LoamValue>,
    /// Nested function prototypes
    pub protos: Vec<GcRef>,
    /// Upvalue names, for debug information (string values)
    pub upval_names: Vec<LoamValue>,
    /// Local-variable names, for debug information (string values)
    pub local_names: Vec<LoamValue>,
    /// Last closure created from this prototype. Purely a cache: a white
    /// cached closure is dropped during traversal so it can be collected.
    pub(crate) cache: Option<GcRef>,
}

impl LoamProto {
    pub fn new(source: LoamValue) -> Self {
        LoamProto {
            source,
            constants: Vec::new(),
            protos: Vec::new(),
            upval_names: Vec::new(),
            local_names: Vec::new(),
            cache: None,
        }
    }

    #[inline]
    pub fn cached_closure(&self) -> Option<GcRef> {
        self.cache
    }
}


