// External imports
use burn::module::Module;
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::tensor::{activation, backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

// Internal imports
use super::step_2_recurrent_cells::{GruStack, LstmStack};

/// Architecture hyperparameters, persisted with every checkpoint so the model
/// shape can be rebuilt before loading weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridModelConfig {
    pub input_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub dropout: f64,
}

impl HybridModelConfig {
    pub fn new(input_size: usize) -> Self {
        Self {
            input_size,
            hidden_size: 128,
            num_layers: 2,
            dropout: 0.2,
        }
    }

    pub fn with_hidden_size(mut self, hidden_size: usize) -> Self {
        self.hidden_size = hidden_size;
        self
    }

    pub fn with_num_layers(mut self, num_layers: usize) -> Self {
        self.num_layers = num_layers;
        self
    }

    pub fn with_dropout(mut self, dropout: f64) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> HybridRecurrentModel<B> {
        HybridRecurrentModel::new(
            self.input_size,
            self.hidden_size,
            self.num_layers,
            self.dropout,
            device,
        )
    }
}

/// Two-stage recurrent network for next-day return prediction.
///
/// Stage one is a stacked LSTM encoder over the input window; stage two is a
/// stacked GRU encoder over stage one's hidden sequence. Only the final GRU
/// time step feeds the dense head: Linear(hidden -> hidden/2), ReLU, dropout,
/// Linear(hidden/2 -> 1). The model holds no state between calls; every
/// forward pass is a pure function of the input window and the weights.
#[derive(Module, Debug)]
pub struct HybridRecurrentModel<B: Backend> {
    input_size: usize,
    hidden_size: usize,
    lstm: LstmStack<B>,
    gru: GruStack<B>,
    fc1: Linear<B>,
    dropout: Dropout,
    fc2: Linear<B>,
}

impl<B: Backend> HybridRecurrentModel<B> {
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        dropout_prob: f64,
        device: &B::Device,
    ) -> Self {
        let lstm = LstmStack::new(input_size, hidden_size, num_layers, dropout_prob, device);
        let gru = GruStack::new(hidden_size, hidden_size, num_layers, dropout_prob, device);
        let fc1 = LinearConfig::new(hidden_size, hidden_size / 2).init(device);
        let dropout = DropoutConfig::new(dropout_prob).init();
        let fc2 = LinearConfig::new(hidden_size / 2, 1).init(device);

        Self {
            input_size,
            hidden_size,
            lstm,
            gru,
            fc1,
            dropout,
            fc2,
        }
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Predicts the next-step return for each window in the batch.
    ///
    /// Input shape [batch, seq_len, input_size], output shape [batch, 1].
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 2> {
        let lstm_out = self.lstm.forward(x);
        let gru_out = self.gru.forward(lstm_out);

        let batch_size = gru_out.dims()[0];
        let last_step_idx = gru_out.dims()[1] - 1;
        let pooled = gru_out
            .narrow(1, last_step_idx, 1)
            .reshape([batch_size, self.hidden_size]);

        let out = self.fc1.forward(pooled);
        let out = activation::relu(out);
        let out = self.dropout.forward(out);
        self.fc2.forward(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    #[test]
    fn test_model_creation() {
        let device = NdArrayDevice::default();
        let config = HybridModelConfig::new(23);
        let model: HybridRecurrentModel<NdArray> = config.init(&device);

        assert_eq!(model.input_size(), 23);
        // Dense head halves the hidden width before the scalar projection
        assert_eq!(model.fc1.weight.dims(), [128, 64]);
        assert_eq!(model.fc2.weight.dims(), [64, 1]);
    }

    #[test]
    fn test_forward_output_shape() {
        let device = NdArrayDevice::default();
        let config = HybridModelConfig::new(10)
            .with_hidden_size(32)
            .with_num_layers(2)
            .with_dropout(0.2);
        let model: HybridRecurrentModel<NdArray> = config.init(&device);

        let input = Tensor::<NdArray, 3>::ones([4, 20, 10], &device);
        let output = model.forward(input);
        assert_eq!(output.dims(), [4, 1]);
    }

    #[test]
    fn test_forward_is_deterministic_without_autodiff() {
        // Dropout must be inert outside training, so two identical calls
        // return identical predictions.
        let device = NdArrayDevice::default();
        let config = HybridModelConfig::new(6).with_hidden_size(16);
        let model: HybridRecurrentModel<NdArray> = config.init(&device);

        let input = Tensor::<NdArray, 3>::ones([2, 12, 6], &device);
        let a = model.forward(input.clone()).to_data().convert::<f32>();
        let b = model.forward(input).to_data().convert::<f32>();
        assert_eq!(
            a.as_slice::<f32>().unwrap(),
            b.as_slice::<f32>().unwrap()
        );
    }

    #[test]
    fn test_single_layer_configuration() {
        let device = NdArrayDevice::default();
        let config = HybridModelConfig::new(5)
            .with_hidden_size(8)
            .with_num_layers(1);
        let model: HybridRecurrentModel<NdArray> = config.init(&device);

        let input = Tensor::<NdArray, 3>::ones([1, 4, 5], &device);
        assert_eq!(model.forward(input).dims(), [1, 1]);
    }
}
