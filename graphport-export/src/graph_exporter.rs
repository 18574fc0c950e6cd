#[cfg(test)]
#[path = "../tests/unit/graph_exporter_test.rs"]
mod graph_exporter_test;

use anyhow::Result;
use log::{debug, info, warn};
use std::path::Path;

use crate::dynamic_axes::DynamicAxisSpec;
use crate::error::ExportError;
use crate::graph::ExportedGraph;
use crate::models::{ModelAdapter, bind_inputs};
use crate::opset::validate_opset;
use crate::tokenizer_adapter::EncodedBatch;
use crate::tracer::{Tracer, ValueId};

/// Traces a model against a sample batch and writes the resulting static graph.
#[derive(Debug, Clone, Copy)]
pub struct GraphExporter {
    opset: u32,
}

impl GraphExporter {
    pub fn new(opset: u32) -> Result<Self> {
        validate_opset(opset)?;
        Ok(Self { opset })
    }

    pub fn opset(&self) -> u32 {
        self.opset
    }

    /// Exports `model` traced on `sample` to `destination`.
    ///
    /// Value-dependent control flow is captured as the branch the sample took.
    /// The file appears only when the whole export succeeded.
    pub fn export(
        &self,
        model: &dyn ModelAdapter,
        sample: &EncodedBatch,
        dynamic_axes: &DynamicAxisSpec,
        destination: &Path,
    ) -> Result<ExportedGraph> {
        let input_names = model.input_names();
        let output_names = model.output_names();

        let declared: Vec<&str> = input_names.iter().chain(output_names).copied().collect();
        dynamic_axes.validate_names(&declared)?;
        self.validate_sample(input_names, sample, dynamic_axes)?;

        info!("Tracing {:?} at opset {}", model.task(), self.opset);
        let mut tracer = Tracer::recording(self.opset);
        let inputs = bind_inputs(&mut tracer, input_names, sample, |name| dynamic_axes.axes(name))?;
        let outputs = model.trace(&mut tracer, &inputs)?;

        if outputs.len() != output_names.len() {
            return Err(ExportError::shape_mismatch(format!(
                "model declares outputs {output_names:?} but produced {} values",
                outputs.len()
            ))
            .into());
        }
        self.verify_dynamic_axes(&tracer, input_names, output_names, &outputs, dynamic_axes)?;
        debug!("Recorded {} nodes", tracer.nodes().len());

        let named: Vec<(ValueId, &str)> = outputs.into_iter().zip(output_names.iter().copied()).collect();
        let graph = tracer.into_graph(&named, dynamic_axes)?;

        let size = graph.write(destination)?;
        info!("💾 Written graph with {} nodes ({size} bytes) to {}", graph.nodes.len(), destination.display());
        Ok(graph)
    }

    fn validate_sample(&self, input_names: &[&str], sample: &EncodedBatch, dynamic_axes: &DynamicAxisSpec) -> Result<()> {
        let provided = sample.field_names();
        if provided.len() != input_names.len() || input_names.iter().any(|name| !provided.contains(name)) {
            return Err(ExportError::shape_mismatch(format!(
                "model expects inputs {input_names:?}, sample provides {provided:?}"
            ))
            .into());
        }
        if sample.batch_size() == 0 || sample.sequence_length() == 0 {
            return Err(ExportError::shape_mismatch(format!(
                "sample batch is empty ({} x {})",
                sample.batch_size(),
                sample.sequence_length()
            ))
            .into());
        }

        for &name in input_names {
            if let Some(tensor) = sample.field(name) {
                dynamic_axes.validate_rank(name, tensor.rank())?;
            }
        }

        let masked = sample.fully_masked_rows()?;
        if !masked.is_empty() {
            warn!("Sample rows {masked:?} have no unmasked position, the traced graph may not match real inputs");
        }
        Ok(())
    }

    fn verify_dynamic_axes(
        &self,
        tracer: &Tracer,
        input_names: &[&str],
        output_names: &[&str],
        outputs: &[ValueId],
        dynamic_axes: &DynamicAxisSpec,
    ) -> Result<()> {
        for (&name, &id) in output_names.iter().zip(outputs) {
            dynamic_axes.validate_rank(name, tracer.shape(id).len())?;
            let Some(axes) = dynamic_axes.axes(name) else { continue };
            for (&axis, symbol) in axes {
                match tracer.symbol(id, axis) {
                    None => {
                        return Err(ExportError::invalid_axis(
                            name,
                            format!("axis {axis} ('{symbol}') is fixed to {} after tracing", tracer.shape(id)[axis]),
                        )
                        .into());
                    }
                    Some(traced) if traced != symbol => {
                        return Err(ExportError::invalid_axis(
                            name,
                            format!("axis {axis} is declared '{symbol}' but follows input axis '{traced}'"),
                        )
                        .into());
                    }
                    Some(_) => {}
                }
            }
        }

        let specialized = tracer.specialized_symbols();
        for &name in input_names {
            let Some(axes) = dynamic_axes.axes(name) else { continue };
            if let Some((axis, symbol)) = axes.iter().find(|(_, symbol)| specialized.contains(symbol.as_str())) {
                return Err(ExportError::invalid_axis(
                    name,
                    format!("axis {axis} ('{symbol}') was specialized to a constant during tracing"),
                )
                .into());
            }
        }
        Ok(())
    }
}
