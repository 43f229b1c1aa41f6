pub mod measurement_field;

pub use measurement_field::{Field, FieldCodec, MeasurementFieldSet, MeasurementFields};
