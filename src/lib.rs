pub mod constants;
pub mod error;
pub mod evaluation;
pub mod service;
pub mod hybrid {
    pub mod step_1_tensor_preparation;
    pub mod step_2_recurrent_cells;
    pub mod step_3_model_arch;
    pub mod step_4_train_model;
    pub mod step_5_forecast;
    pub mod step_6_model_serialization;
}
pub mod util {
    pub mod feature_engineering;
    pub mod model_utils;
    pub mod pre_processor;
}
