#![forbid(unsafe_code)]

use ff_kernel_cpu::{ArrayKernels, CpuKernels};
use ff_runtime::{EvidenceEntry, EvidenceKind, RuntimeContext};

pub use ff_array::{
    ArrayValue, ErrorKind, ScalarIndex, TensorArray, TensorArrayError, TensorArrayOptions,
};
pub use ff_core::{DType, DenseTensor, ExecutionMode, PartialShape, ShapeError, TensorError};
pub use ff_kernel_cpu::KernelError;

/// Frontend entry point: eager array ops plus `TensorArray` construction,
/// with every call recorded in the session ledger.
#[derive(Debug, Clone)]
pub struct FrankenFlowSession {
    kernels: CpuKernels,
    runtime: RuntimeContext,
}

impl FrankenFlowSession {
    #[must_use]
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            kernels: CpuKernels,
            runtime: RuntimeContext::new(mode),
        }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.runtime.mode()
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.runtime.set_mode(mode);
    }

    pub fn constant(
        &mut self,
        shape: Vec<usize>,
        data: Vec<f64>,
        dtype: DType,
    ) -> Result<DenseTensor, TensorError> {
        let out = DenseTensor::new(shape, data, dtype)?;
        self.record_operation("constant", &out);
        Ok(out)
    }

    pub fn zeros(&mut self, shape: &[usize], dtype: DType) -> DenseTensor {
        let out = self.kernels.zeros(shape, dtype);
        self.record_operation("zeros", &out);
        out
    }

    pub fn cast(&mut self, value: &DenseTensor, dtype: DType) -> Result<DenseTensor, KernelError> {
        let out = self.kernels.cast(value, dtype)?;
        self.record_operation("cast", &out);
        Ok(out)
    }

    pub fn stack(&mut self, values: &[DenseTensor]) -> Result<DenseTensor, KernelError> {
        let out = self.kernels.stack(values)?;
        self.record_operation("stack", &out);
        Ok(out)
    }

    pub fn concat(
        &mut self,
        values: &[DenseTensor],
        axis: usize,
    ) -> Result<DenseTensor, KernelError> {
        let out = self.kernels.concat(values, axis)?;
        self.record_operation("concat", &out);
        Ok(out)
    }

    pub fn split(
        &mut self,
        value: &DenseTensor,
        lengths: &[usize],
    ) -> Result<Vec<DenseTensor>, KernelError> {
        let parts = self.kernels.split(value, lengths)?;
        self.runtime.record(
            EvidenceKind::Dispatch,
            format!("op=split parts={} lengths={lengths:?}", parts.len()),
        );
        Ok(parts)
    }

    pub fn unstack(&mut self, value: &DenseTensor) -> Result<Vec<DenseTensor>, KernelError> {
        let parts = self.kernels.unstack(value)?;
        self.runtime.record(
            EvidenceKind::Dispatch,
            format!("op=unstack parts={}", parts.len()),
        );
        Ok(parts)
    }

    /// Creates an array that inherits the session's execution mode.
    pub fn tensor_array(
        &mut self,
        dtype: DType,
        size: impl ScalarIndex,
        options: TensorArrayOptions,
    ) -> Result<TensorArray, TensorArrayError> {
        let options = options.with_mode(self.mode());
        let array = TensorArray::with_options(dtype, size, options)?;
        self.runtime.record(
            EvidenceKind::Dispatch,
            format!(
                "op=tensor_array dtype={dtype} size={} dynamic_size={}",
                array.size(),
                array.dynamic_size()
            ),
        );
        Ok(array)
    }

    #[must_use]
    pub fn evidence(&self) -> &[EvidenceEntry] {
        self.runtime.ledger().entries()
    }

    #[must_use]
    pub fn evidence_len(&self) -> usize {
        self.runtime.ledger().len()
    }

    fn record_operation(&mut self, op: &str, out: &DenseTensor) {
        self.runtime.record(
            EvidenceKind::Dispatch,
            format!(
                "op={op} out_shape={:?} dtype={} mode={:?}",
                out.shape(),
                out.dtype(),
                self.runtime.mode()
            ),
        );
    }
}

impl Default for FrankenFlowSession {
    fn default() -> Self {
        Self::new(ExecutionMode::Strict)
    }
}
