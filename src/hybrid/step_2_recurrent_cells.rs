// External imports
use burn::module::Module;
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::tensor::{activation, backend::Backend, Tensor};

/// Single LSTM layer.
///
/// All four gates share one input projection and one hidden projection
/// (gate_size = 4 * hidden_size); the combined output is reshaped to
/// [batch, 4, hidden] and split per gate.
#[derive(Module, Debug)]
pub struct LstmLayer<B: Backend> {
    input_size: usize,
    hidden_size: usize,
    input_weights: Linear<B>,
    hidden_weights: Linear<B>,
}

impl<B: Backend> LstmLayer<B> {
    pub fn new(input_size: usize, hidden_size: usize, device: &B::Device) -> Self {
        let gate_size = 4 * hidden_size; // input, forget, cell, output gates combined

        let input_weights = LinearConfig::new(input_size, gate_size).init(device);
        let hidden_weights = LinearConfig::new(hidden_size, gate_size).init(device);

        Self {
            input_size,
            hidden_size,
            input_weights,
            hidden_weights,
        }
    }

    /// Processes the full sequence, emitting the hidden state at every step.
    ///
    /// Input shape [batch, seq_len, input_size], output shape
    /// [batch, seq_len, hidden_size].
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let device = x.device();
        let batch_size = x.dims()[0];
        let seq_len = x.dims()[1];

        let mut h = Tensor::zeros([batch_size, self.hidden_size], &device);
        let mut c = Tensor::zeros([batch_size, self.hidden_size], &device);

        let mut output_sequence = Tensor::zeros([batch_size, seq_len, self.hidden_size], &device);

        for t in 0..seq_len {
            let x_t = x
                .clone()
                .narrow(1, t, 1)
                .reshape([batch_size, self.input_size]);

            let input_projection = self.input_weights.forward(x_t);
            let hidden_projection = self.hidden_weights.forward(h);

            let gates = (input_projection + hidden_projection)
                .reshape([batch_size, 4, self.hidden_size]);
            let i_gate = gates
                .clone()
                .narrow(1, 0, 1)
                .reshape([batch_size, self.hidden_size]);
            let f_gate = gates
                .clone()
                .narrow(1, 1, 1)
                .reshape([batch_size, self.hidden_size]);
            let g_gate = gates
                .clone()
                .narrow(1, 2, 1)
                .reshape([batch_size, self.hidden_size]);
            let o_gate = gates
                .narrow(1, 3, 1)
                .reshape([batch_size, self.hidden_size]);

            let i = activation::sigmoid(i_gate);
            let f = activation::sigmoid(f_gate);
            let g = activation::tanh(g_gate);
            let o = activation::sigmoid(o_gate);

            c = f * c + i * g;
            h = o * activation::tanh(c.clone());

            output_sequence = output_sequence.slice_assign(
                [0..batch_size, t..t + 1, 0..self.hidden_size],
                h.clone().reshape([batch_size, 1, self.hidden_size]),
            );
        }

        output_sequence
    }
}

/// Single GRU layer with the update/reset/candidate gates combined into one
/// projection pair (gate_size = 3 * hidden_size).
#[derive(Module, Debug)]
pub struct GruLayer<B: Backend> {
    input_size: usize,
    hidden_size: usize,
    input_weights: Linear<B>,
    hidden_weights: Linear<B>,
}

impl<B: Backend> GruLayer<B> {
    pub fn new(input_size: usize, hidden_size: usize, device: &B::Device) -> Self {
        let gate_size = 3 * hidden_size;

        let input_weights = LinearConfig::new(input_size, gate_size).init(device);
        let hidden_weights = LinearConfig::new(hidden_size, gate_size).init(device);

        Self {
            input_size,
            hidden_size,
            input_weights,
            hidden_weights,
        }
    }

    /// Input shape [batch, seq_len, input_size], output shape
    /// [batch, seq_len, hidden_size].
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let device = x.device();
        let batch_size = x.dims()[0];
        let seq_len = x.dims()[1];

        let mut h = Tensor::zeros([batch_size, self.hidden_size], &device);
        let mut output_sequence = Tensor::zeros([batch_size, seq_len, self.hidden_size], &device);

        for t in 0..seq_len {
            let x_t = x
                .clone()
                .narrow(1, t, 1)
                .reshape([batch_size, self.input_size]);

            let input_projection = self.input_weights.forward(x_t);
            let hidden_projection = self.hidden_weights.forward(h.clone());

            let input_gates = input_projection.reshape([batch_size, 3, self.hidden_size]);
            let z_input = input_gates
                .clone()
                .narrow(1, 0, 1)
                .reshape([batch_size, self.hidden_size]);
            let r_input = input_gates
                .clone()
                .narrow(1, 1, 1)
                .reshape([batch_size, self.hidden_size]);
            let n_input = input_gates
                .narrow(1, 2, 1)
                .reshape([batch_size, self.hidden_size]);

            let hidden_gates = hidden_projection.reshape([batch_size, 3, self.hidden_size]);
            let z_hidden = hidden_gates
                .clone()
                .narrow(1, 0, 1)
                .reshape([batch_size, self.hidden_size]);
            let r_hidden = hidden_gates
                .clone()
                .narrow(1, 1, 1)
                .reshape([batch_size, self.hidden_size]);
            let n_hidden = hidden_gates
                .narrow(1, 2, 1)
                .reshape([batch_size, self.hidden_size]);

            let z = activation::sigmoid(z_input + z_hidden);
            let r = activation::sigmoid(r_input + r_hidden);
            let n = activation::tanh(n_input + (r * n_hidden));

            // h = (1 - z) * n + z * h
            h = (Tensor::ones_like(&z) - z.clone()) * n + z * h;

            output_sequence = output_sequence.slice_assign(
                [0..batch_size, t..t + 1, 0..self.hidden_size],
                h.clone().reshape([batch_size, 1, self.hidden_size]),
            );
        }

        output_sequence
    }
}

/// Stack of LSTM layers with dropout applied between layers (not after the
/// last one). Dropout only fires under an autodiff backend, so inference is
/// unaffected.
#[derive(Module, Debug)]
pub struct LstmStack<B: Backend> {
    layers: Vec<LstmLayer<B>>,
    dropout: Dropout,
}

impl<B: Backend> LstmStack<B> {
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        dropout_prob: f64,
        device: &B::Device,
    ) -> Self {
        let mut layers = Vec::with_capacity(num_layers);
        for layer_idx in 0..num_layers {
            let in_size = if layer_idx == 0 { input_size } else { hidden_size };
            layers.push(LstmLayer::new(in_size, hidden_size, device));
        }

        Self {
            layers,
            dropout: DropoutConfig::new(dropout_prob).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let last = self.layers.len() - 1;
        let mut out = x;
        for (idx, layer) in self.layers.iter().enumerate() {
            out = layer.forward(out);
            if idx < last {
                out = self.dropout.forward(out);
            }
        }
        out
    }
}

/// Stack of GRU layers, same layering rules as [`LstmStack`].
#[derive(Module, Debug)]
pub struct GruStack<B: Backend> {
    layers: Vec<GruLayer<B>>,
    dropout: Dropout,
}

impl<B: Backend> GruStack<B> {
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        dropout_prob: f64,
        device: &B::Device,
    ) -> Self {
        let mut layers = Vec::with_capacity(num_layers);
        for layer_idx in 0..num_layers {
            let in_size = if layer_idx == 0 { input_size } else { hidden_size };
            layers.push(GruLayer::new(in_size, hidden_size, device));
        }

        Self {
            layers,
            dropout: DropoutConfig::new(dropout_prob).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let last = self.layers.len() - 1;
        let mut out = x;
        for (idx, layer) in self.layers.iter().enumerate() {
            out = layer.forward(out);
            if idx < last {
                out = self.dropout.forward(out);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    #[test]
    fn test_lstm_layer_output_shape() {
        let device = NdArrayDevice::default();
        let layer: LstmLayer<NdArray> = LstmLayer::new(8, 16, &device);

        let input = Tensor::<NdArray, 3>::ones([2, 5, 8], &device);
        let output = layer.forward(input);
        assert_eq!(output.dims(), [2, 5, 16]);
    }

    #[test]
    fn test_gru_layer_output_shape() {
        let device = NdArrayDevice::default();
        let layer: GruLayer<NdArray> = GruLayer::new(8, 16, &device);

        let input = Tensor::<NdArray, 3>::ones([2, 5, 8], &device);
        let output = layer.forward(input);
        assert_eq!(output.dims(), [2, 5, 16]);
    }

    #[test]
    fn test_stacks_chain_layer_widths() {
        let device = NdArrayDevice::default();
        let lstm: LstmStack<NdArray> = LstmStack::new(8, 16, 2, 0.2, &device);
        let gru: GruStack<NdArray> = GruStack::new(16, 16, 2, 0.2, &device);

        let input = Tensor::<NdArray, 3>::ones([3, 7, 8], &device);
        let encoded = lstm.forward(input);
        assert_eq!(encoded.dims(), [3, 7, 16]);

        let output = gru.forward(encoded);
        assert_eq!(output.dims(), [3, 7, 16]);
    }

    #[test]
    fn test_hidden_states_stay_bounded() {
        // Both cell types squash through tanh, so hidden magnitudes stay
        // within [-1, 1] no matter the input scale.
        let device = NdArrayDevice::default();
        let layer: GruLayer<NdArray> = GruLayer::new(4, 8, &device);

        let input = Tensor::<NdArray, 3>::ones([1, 6, 4], &device) * 50.0;
        let output = layer.forward(input);
        let data = output.to_data().convert::<f32>();
        let slice = data.as_slice::<f32>().unwrap();
        for &v in slice {
            assert!(v.abs() <= 1.0 + 1e-5);
        }
    }
}
