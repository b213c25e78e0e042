//! Ordered inference input builder
//!
//! Sub-model graphs take their inputs positionally; the builder collects
//! values in declaration order and the session handle pairs them with the
//! graph's input names and dtypes at run time. Timesteps and token ids are
//! recorded abstractly and resolved against the graph metadata, since
//! exported models disagree on int64 vs float/int32 for those inputs.

use ndarray::{Array1, ArrayD, Dimension};

/// One pending input value.
pub enum InputValue {
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
    /// Scalar timestep; dtype decided by the graph's input signature.
    Timestep(f32),
    /// Token id row `[1, len]`; dtype decided by the graph's input signature.
    TokenIds(Vec<i64>),
}

/// Ordered parameter list for one `run` call.
///
/// Output shape hints are optional; an empty hint list lets the backend
/// allocate every output. A provided hint is validated against the shape
/// the backend actually produced.
#[derive(Default)]
pub struct InferenceParameters {
    inputs: Vec<InputValue>,
    output_hints: Vec<Option<Vec<usize>>>,
}

impl InferenceParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a float tensor of any dimensionality.
    pub fn push<D: Dimension>(&mut self, tensor: ndarray::Array<f32, D>) {
        self.inputs.push(InputValue::F32(tensor.into_dyn()));
    }

    /// Appends a pre-built value (used for ControlNet residuals).
    pub fn push_value(&mut self, value: InputValue) {
        self.inputs.push(value);
    }

    /// Appends a scalar timestep whose dtype follows the graph signature.
    pub fn push_timestep(&mut self, timestep: f32) {
        self.inputs.push(InputValue::Timestep(timestep));
    }

    /// Appends a `[1, len]` token id row whose dtype follows the graph
    /// signature.
    pub fn push_token_ids(&mut self, ids: Vec<i64>) {
        self.inputs.push(InputValue::TokenIds(ids));
    }

    /// Appends an f64 scalar (ControlNet conditioning scale).
    pub fn push_scalar_f64(&mut self, value: f64) {
        self.inputs
            .push(InputValue::F64(Array1::from_vec(vec![value]).into_dyn()));
    }

    /// Declares the expected shape of the next output. `None` leaves the
    /// allocation entirely to the backend.
    pub fn push_output_hint(&mut self, shape: Option<Vec<usize>>) {
        self.output_hints.push(shape);
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub(crate) fn into_parts(self) -> (Vec<InputValue>, Vec<Option<Vec<usize>>>) {
        (self.inputs, self.output_hints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn test_inputs_keep_declaration_order() {
        let mut params = InferenceParameters::new();
        params.push(Array4::<f32>::zeros((1, 4, 8, 8)));
        params.push_timestep(981.0);
        params.push_token_ids(vec![49406, 320, 49407]);
        assert_eq!(params.len(), 3);

        let (inputs, _) = params.into_parts();
        assert!(matches!(inputs[0], InputValue::F32(_)));
        assert!(matches!(inputs[1], InputValue::Timestep(_)));
        assert!(matches!(inputs[2], InputValue::TokenIds(_)));
    }

    #[test]
    fn test_output_hints() {
        let mut params = InferenceParameters::new();
        params.push_output_hint(Some(vec![1, 4, 64, 64]));
        params.push_output_hint(None);
        let (_, hints) = params.into_parts();
        assert_eq!(hints.len(), 2);
        assert_eq!(hints[0].as_deref(), Some(&[1, 4, 64, 64][..]));
    }
}
