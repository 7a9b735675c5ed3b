//! Kernel program sources, embedded at compile time.

use cascade_core::DType;

/// A program whose source is specialised per element type by prepending a
/// `scalar_t` typedef.
#[derive(Debug, Clone, Copy)]
pub struct KernelSource {
    pub name: &'static str,
    pub body: &'static str,
}

impl KernelSource {
    /// Full program text for `dtype`.
    pub fn specialize(&self, dtype: DType) -> String {
        let pragma = match dtype {
            DType::F16 => "#pragma OPENCL EXTENSION cl_khr_fp16 : enable\n",
            DType::F64 => "#pragma OPENCL EXTENSION cl_khr_fp64 : enable\n",
            _ => "",
        };
        format!(
            "{}typedef {} scalar_t;\n\n{}",
            pragma,
            dtype.kernel_type_name(),
            self.body
        )
    }
}

pub const ELEMENTWISE_BROADCASTED: KernelSource = KernelSource {
    name: "elementwise_broadcasted",
    body: include_str!("elementwise_broadcasted.cl"),
};

pub const TRANSFORM: KernelSource = KernelSource {
    name: "transform",
    body: include_str!("transform.cl"),
};

pub const REDUCE: KernelSource = KernelSource {
    name: "reduce",
    body: include_str!("reduce.cl"),
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::compile;

    #[test]
    fn test_all_sources_build_for_all_types() {
        for source in [ELEMENTWISE_BROADCASTED, TRANSFORM, REDUCE] {
            for dtype in DType::ALL {
                let program = compile(source.name, &source.specialize(dtype), "")
                    .unwrap_or_else(|e| panic!("{} for {}: {}", source.name, dtype, e));
                assert_eq!(program.dtype(), dtype);
            }
        }
    }

    #[test]
    fn test_entry_points() {
        let p = compile(
            ELEMENTWISE_BROADCASTED.name,
            &ELEMENTWISE_BROADCASTED.specialize(DType::F32),
            "",
        )
        .unwrap();
        assert_eq!(p.entry_names(), &["plus", "minus", "multiply", "divide"]);
    }
}
