//! Model handle around the detection graph.
//!
//! The graph takes one `[1, height, width, 3]` `i32` frame and produces a
//! fixed set of outputs, three of which are consumed: boxes, scores and
//! classes. Which outputs those are is part of a contract that is checked when
//! the graph is loaded and again on every inference.
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use common::{detection::SlotCountMismatch, RawPrediction};
use image::RgbImage;
use thiserror::Error;
use tract_onnx::prelude::*;

use crate::utils::resolve_model_location;

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Raw graph outputs of one inference call.
pub type NnOut = TVec<Tensor>;

/// The consumed graph outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputRole {
    Boxes,
    Scores,
    Classes,
}

impl fmt::Display for OutputRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputRole::Boxes => "boxes",
            OutputRole::Scores => "scores",
            OutputRole::Classes => "classes",
        };
        f.write_str(name)
    }
}

/// The graph does not produce what the detection loop consumes.
#[derive(Error, Debug)]
pub enum ModelContractError {
    #[error("graph declares {actual} outputs, expected {expected}")]
    OutputCount { expected: usize, actual: usize },
    #[error("graph has no {role} output named {name:?}, available: {available:?}")]
    UnknownOutput {
        role: OutputRole,
        name: String,
        available: Vec<String>,
    },
    #[error("{role} output index {index} is out of range for {count} outputs")]
    IndexOutOfRange {
        role: OutputRole,
        index: usize,
        count: usize,
    },
    #[error("{role} output has shape {shape:?}")]
    Shape { role: OutputRole, shape: Vec<usize> },
    #[error("{role} output cannot be read: {reason}")]
    Datum { role: OutputRole, reason: String },
    #[error(transparent)]
    Slots(#[from] SlotCountMismatch),
}

/// Errors of the model handle.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("failed to fetch model from {location}: {reason}")]
    Fetch { location: String, reason: String },
    #[error("failed to load model graph {path}: {reason}")]
    Load { path: PathBuf, reason: String },
    #[error("frame is {actual:?}, model expects {expected:?}")]
    InputSize {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("model contract violated: {0}")]
    Contract(#[from] ModelContractError),
}

/// Selects a graph output by name or by position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputSelector {
    Index(usize),
    Name(String),
}

impl FromStr for OutputSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty output selector".into());
        }
        Ok(match s.parse::<usize>() {
            Ok(index) => OutputSelector::Index(index),
            Err(_) => OutputSelector::Name(s.to_owned()),
        })
    }
}

impl fmt::Display for OutputSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputSelector::Index(index) => write!(f, "{index}"),
            OutputSelector::Name(name) => f.write_str(name),
        }
    }
}

/// Selectors of the three consumed outputs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputSelectors {
    pub boxes: OutputSelector,
    pub scores: OutputSelector,
    pub classes: OutputSelector,
}

impl Default for OutputSelectors {
    /// Layout of the seven-output SSD graph.
    fn default() -> Self {
        Self {
            boxes: OutputSelector::Index(4),
            scores: OutputSelector::Index(5),
            classes: OutputSelector::Index(6),
        }
    }
}

/// Resolved output positions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputLayout {
    pub boxes: usize,
    pub scores: usize,
    pub classes: usize,
}

impl OutputLayout {
    /// Resolve selectors against the output names a graph declares.
    pub fn resolve(
        selectors: &OutputSelectors,
        output_names: &[String],
        expected_outputs: Option<usize>,
    ) -> Result<Self, ModelContractError> {
        if let Some(expected) = expected_outputs {
            if output_names.len() != expected {
                return Err(ModelContractError::OutputCount {
                    expected,
                    actual: output_names.len(),
                });
            }
        }

        let resolve_one = |role: OutputRole, selector: &OutputSelector| match selector {
            OutputSelector::Index(index) if *index < output_names.len() => Ok(*index),
            OutputSelector::Index(index) => Err(ModelContractError::IndexOutOfRange {
                role,
                index: *index,
                count: output_names.len(),
            }),
            OutputSelector::Name(name) => output_names
                .iter()
                .position(|candidate| candidate == name)
                .ok_or_else(|| ModelContractError::UnknownOutput {
                    role,
                    name: name.clone(),
                    available: output_names.to_vec(),
                }),
        };

        Ok(Self {
            boxes: resolve_one(OutputRole::Boxes, &selectors.boxes)?,
            scores: resolve_one(OutputRole::Scores, &selectors.scores)?,
            classes: resolve_one(OutputRole::Classes, &selectors.classes)?,
        })
    }
}

/// Where and how to load the detection graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelConfig {
    /// Local path or `http(s)://` URL of an ONNX graph.
    pub location: String,
    /// `(width, height)` of the frames fed to the graph.
    pub input_size: (u32, u32),
    pub outputs: OutputSelectors,
    /// Number of outputs the graph must declare, if checked.
    pub expected_outputs: Option<usize>,
    /// Directory for downloaded graphs.
    pub cache_dir: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            location: "models/kangaroo-detector.onnx".into(),
            input_size: (640, 480),
            outputs: OutputSelectors::default(),
            expected_outputs: Some(7),
            cache_dir: None,
        }
    }
}

/// Runtime executing a loaded graph.
pub trait InferModel: Send + Sync {
    /// `(width, height)` of accepted frames.
    fn input_size(&self) -> (u32, u32);

    /// Names of the graph outputs, in output order.
    fn output_names(&self) -> Vec<String>;

    fn run(&self, input: Tensor) -> Result<NnOut, ModelError>;
}

/// ONNX graph executed by tract.
pub struct TractModel {
    model: NnModel,
    input_size: (u32, u32),
    output_names: Vec<String>,
}

impl TractModel {
    pub fn from_path(path: &Path, input_size: (u32, u32)) -> Result<Self, ModelError> {
        let load_err = |e: TractError| ModelError::Load {
            path: path.to_path_buf(),
            reason: format!("{e:#}"),
        };
        let (width, height) = input_size;
        let input_fact = InferenceFact::dt_shape(
            i32::datum_type(),
            tvec!(1, height as usize, width as usize, 3),
        );

        let model = tract_onnx::onnx()
            .model_for_path(path)
            .map_err(load_err)?
            .with_input_fact(0, input_fact)
            .map_err(load_err)?;

        let output_names = model
            .outputs
            .iter()
            .map(|outlet| {
                model
                    .outlet_label(*outlet)
                    .map(str::to_owned)
                    .unwrap_or_else(|| model.node(outlet.node).name.clone())
            })
            .collect();

        let model = model
            .into_optimized()
            .map_err(load_err)?
            .into_runnable()
            .map_err(load_err)?;

        Ok(Self {
            model,
            input_size,
            output_names,
        })
    }
}

impl InferModel for TractModel {
    fn input_size(&self) -> (u32, u32) {
        self.input_size
    }

    fn output_names(&self) -> Vec<String> {
        self.output_names.clone()
    }

    fn run(&self, input: Tensor) -> Result<NnOut, ModelError> {
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .map_err(|e| ModelError::Inference(format!("{e:#}")))?;

        Ok(outputs.into_iter().map(|t| t.into_tensor()).collect())
    }
}

/// Loaded graph together with its resolved output contract.
#[derive(Clone)]
pub struct ModelHandle {
    model: Arc<dyn InferModel>,
    layout: OutputLayout,
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("input_size", &self.model.input_size())
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl ModelHandle {
    /// Wrap a model, failing fast if its outputs do not match `selectors`.
    pub fn new(
        model: Arc<dyn InferModel>,
        selectors: &OutputSelectors,
        expected_outputs: Option<usize>,
    ) -> Result<Self, ModelContractError> {
        let layout = OutputLayout::resolve(selectors, &model.output_names(), expected_outputs)?;
        Ok(Self { model, layout })
    }

    pub fn input_size(&self) -> (u32, u32) {
        self.model.input_size()
    }

    pub fn layout(&self) -> OutputLayout {
        self.layout
    }

    /// Encode a frame as a `[1, height, width, 3]` `i32` tensor.
    pub fn encode(&self, frame: &RgbImage) -> Result<Tensor, ModelError> {
        let expected = self.input_size();
        if frame.dimensions() != expected {
            return Err(ModelError::InputSize {
                expected,
                actual: frame.dimensions(),
            });
        }

        let (width, height) = frame.dimensions();
        let tensor: Tensor = tract_ndarray::Array4::from_shape_fn(
            (1, height as usize, width as usize, 3),
            |(_, y, x, c)| frame[(x as _, y as _)][c] as i32,
        )
        .into();

        Ok(tensor)
    }

    /// Run the graph on an encoded frame without blocking the runtime.
    pub async fn infer(&self, input: Tensor) -> Result<NnOut, ModelError> {
        let model = Arc::clone(&self.model);
        tokio::task::spawn_blocking(move || model.run(input))
            .await
            .map_err(|e| ModelError::Inference(format!("inference task failed: {e}")))?
    }

    /// Read boxes, scores and classes out of the graph outputs.
    pub fn extract(&self, outputs: &[Tensor]) -> Result<RawPrediction, ModelContractError> {
        let output = |role: OutputRole, index: usize| {
            outputs
                .get(index)
                .ok_or(ModelContractError::IndexOutOfRange {
                    role,
                    index,
                    count: outputs.len(),
                })
                .map(|tensor| (role, tensor))
        };

        let (role, tensor) = output(OutputRole::Boxes, self.layout.boxes)?;
        let boxes = read_values::<f32>(role, tensor)?;
        let (role, tensor) = output(OutputRole::Scores, self.layout.scores)?;
        let scores = read_values::<f32>(role, tensor)?;
        let (role, tensor) = output(OutputRole::Classes, self.layout.classes)?;
        let classes = read_values::<i64>(role, tensor)?;

        let boxes = boxes
            .chunks_exact(4)
            .map(|c| [c[0], c[1], c[2], c[3]])
            .collect();

        Ok(RawPrediction::new(boxes, scores, classes)?)
    }
}

/// Flatten one output after checking its shape.
///
/// Boxes are `[1, n, 4]` or `[n, 4]`, scores and classes `[1, n]` or `[n]`.
fn read_values<T: Datum + Copy>(
    role: OutputRole,
    tensor: &Tensor,
) -> Result<Vec<T>, ModelContractError> {
    let shape = tensor.shape();
    let valid = match (role, shape) {
        (OutputRole::Boxes, [1, _, 4]) | (OutputRole::Boxes, [_, 4]) => true,
        (OutputRole::Scores | OutputRole::Classes, [1, _]) => true,
        (OutputRole::Scores | OutputRole::Classes, [_]) => true,
        _ => false,
    };
    if !valid {
        return Err(ModelContractError::Shape {
            role,
            shape: shape.to_vec(),
        });
    }

    let datum_err = |e: TractError| ModelContractError::Datum {
        role,
        reason: format!("{e:#}"),
    };
    let cast = tensor.cast_to::<T>().map_err(datum_err)?;
    let values = cast
        .to_array_view::<T>()
        .map_err(datum_err)?
        .iter()
        .copied()
        .collect();

    Ok(values)
}

/// Fetch and load the configured graph.
pub async fn load_model(config: &ModelConfig) -> Result<ModelHandle, ModelError> {
    let path = resolve_model_location(&config.location, config.cache_dir.as_deref()).await?;
    let input_size = config.input_size;

    let model = {
        let model_path = path.clone();
        tokio::task::spawn_blocking(move || TractModel::from_path(&model_path, input_size))
            .await
            .map_err(|e| ModelError::Load {
                path,
                reason: format!("loader task failed: {e}"),
            })??
    };

    log::info!(
        "Loaded model {} with outputs {:?}",
        config.location,
        model.output_names()
    );

    Ok(ModelHandle::new(
        Arc::new(model),
        &config.outputs,
        config.expected_outputs,
    )?)
}

#[cfg(test)]
mod test {
    use image::Rgb;

    use super::*;

    struct FixedModel {
        names: Vec<String>,
        outputs: Vec<Tensor>,
    }

    impl InferModel for FixedModel {
        fn input_size(&self) -> (u32, u32) {
            (3, 2)
        }

        fn output_names(&self) -> Vec<String> {
            self.names.clone()
        }

        fn run(&self, _input: Tensor) -> Result<NnOut, ModelError> {
            Ok(self.outputs.iter().cloned().collect())
        }
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn parse_selectors() {
        assert_eq!("4".parse(), Ok(OutputSelector::Index(4)));
        assert_eq!(
            "detection_boxes".parse(),
            Ok(OutputSelector::Name("detection_boxes".into()))
        );
        assert!("  ".parse::<OutputSelector>().is_err());
    }

    #[test]
    fn resolve_default_layout() -> Result<(), ModelContractError> {
        let outputs = names(&["a", "b", "c", "d", "e", "f", "g"]);

        let layout = OutputLayout::resolve(&OutputSelectors::default(), &outputs, Some(7))?;

        assert_eq!(
            layout,
            OutputLayout {
                boxes: 4,
                scores: 5,
                classes: 6
            }
        );

        Ok(())
    }

    #[test]
    fn resolve_named_layout() -> Result<(), ModelContractError> {
        let outputs = names(&["detection_scores", "detection_classes", "detection_boxes"]);
        let selectors = OutputSelectors {
            boxes: OutputSelector::Name("detection_boxes".into()),
            scores: OutputSelector::Name("detection_scores".into()),
            classes: OutputSelector::Name("detection_classes".into()),
        };

        let layout = OutputLayout::resolve(&selectors, &outputs, None)?;

        assert_eq!(
            layout,
            OutputLayout {
                boxes: 2,
                scores: 0,
                classes: 1
            }
        );

        Ok(())
    }

    #[test]
    fn reject_broken_contracts() {
        let outputs = names(&["a", "b", "c"]);

        assert!(matches!(
            OutputLayout::resolve(&OutputSelectors::default(), &outputs, Some(7)),
            Err(ModelContractError::OutputCount {
                expected: 7,
                actual: 3
            })
        ));
        assert!(matches!(
            OutputLayout::resolve(&OutputSelectors::default(), &outputs, None),
            Err(ModelContractError::IndexOutOfRange {
                role: OutputRole::Boxes,
                index: 4,
                count: 3
            })
        ));

        let selectors = OutputSelectors {
            boxes: OutputSelector::Name("detection_boxes".into()),
            scores: OutputSelector::Index(1),
            classes: OutputSelector::Index(2),
        };
        assert!(matches!(
            OutputLayout::resolve(&selectors, &outputs, None),
            Err(ModelContractError::UnknownOutput { role: OutputRole::Boxes, .. })
        ));
    }

    #[test]
    fn encode_frame_without_normalisation() -> Result<(), Box<dyn std::error::Error>> {
        let model = FixedModel {
            names: names(&["boxes", "scores", "classes"]),
            outputs: vec![],
        };
        let handle = ModelHandle::new(
            Arc::new(model),
            &OutputSelectors {
                boxes: OutputSelector::Index(0),
                scores: OutputSelector::Index(1),
                classes: OutputSelector::Index(2),
            },
            Some(3),
        )?;

        let mut frame = RgbImage::new(3, 2);
        frame.put_pixel(2, 1, Rgb([255, 128, 7]));

        let tensor = handle.encode(&frame)?;
        assert_eq!(tensor.shape(), &[1, 2, 3, 3]);
        assert_eq!(tensor.datum_type(), i32::datum_type());
        let view = tensor
            .to_array_view::<i32>()?
            .into_dimensionality::<tract_ndarray::Ix4>()?;
        assert_eq!(view[[0, 1, 2, 0]], 255);
        assert_eq!(view[[0, 1, 2, 1]], 128);
        assert_eq!(view[[0, 1, 2, 2]], 7);
        assert_eq!(view[[0, 0, 0, 0]], 0);

        let wrong_size = handle.encode(&RgbImage::new(4, 4));
        assert!(matches!(
            wrong_size,
            Err(ModelError::InputSize {
                expected: (3, 2),
                actual: (4, 4)
            })
        ));

        Ok(())
    }

    #[tokio::test]
    async fn extract_named_outputs() -> Result<(), Box<dyn std::error::Error>> {
        let boxes: Tensor =
            tract_ndarray::arr3(&[[[0.1f32, 0.2, 0.5, 0.6], [0.0, 0.0, 1.0, 1.0]]]).into();
        let scores: Tensor = tract_ndarray::arr2(&[[0.9f32, 0.3]]).into();
        let classes: Tensor = tract_ndarray::arr2(&[[1.0f32, 2.0]]).into();
        let model = FixedModel {
            names: names(&["detection_classes", "detection_boxes", "detection_scores"]),
            outputs: vec![classes, boxes, scores],
        };
        let selectors = OutputSelectors {
            boxes: OutputSelector::Name("detection_boxes".into()),
            scores: OutputSelector::Name("detection_scores".into()),
            classes: OutputSelector::Name("detection_classes".into()),
        };
        let handle = ModelHandle::new(Arc::new(model), &selectors, Some(3))?;

        let input = handle.encode(&RgbImage::new(3, 2))?;
        let outputs = handle.infer(input).await?;
        let raw = handle.extract(&outputs)?;

        let slots: Vec<_> = raw.slots().map(|(b, s, c)| (*b, s, c)).collect();
        assert_eq!(
            slots,
            vec![
                ([0.1, 0.2, 0.5, 0.6], 0.9, 1),
                ([0.0, 0.0, 1.0, 1.0], 0.3, 2)
            ]
        );

        Ok(())
    }

    #[test]
    fn reject_malformed_outputs() -> Result<(), Box<dyn std::error::Error>> {
        let selectors = OutputSelectors {
            boxes: OutputSelector::Index(0),
            scores: OutputSelector::Index(1),
            classes: OutputSelector::Index(2),
        };
        let handle = ModelHandle::new(
            Arc::new(FixedModel {
                names: names(&["boxes", "scores", "classes"]),
                outputs: vec![],
            }),
            &selectors,
            Some(3),
        )?;

        // Boxes with three coordinates
        let outputs: Vec<Tensor> = vec![
            tract_ndarray::arr3(&[[[0.0f32, 0.0, 1.0]]]).into(),
            tract_ndarray::arr2(&[[0.9f32]]).into(),
            tract_ndarray::arr2(&[[1i64]]).into(),
        ];
        assert!(matches!(
            handle.extract(&outputs),
            Err(ModelContractError::Shape {
                role: OutputRole::Boxes,
                ..
            })
        ));

        // Two boxes but one score
        let outputs: Vec<Tensor> = vec![
            tract_ndarray::arr3(&[[[0.0f32, 0.0, 1.0, 1.0], [0.0, 0.0, 1.0, 1.0]]]).into(),
            tract_ndarray::arr2(&[[0.9f32]]).into(),
            tract_ndarray::arr2(&[[1i64, 2]]).into(),
        ];
        assert!(matches!(
            handle.extract(&outputs),
            Err(ModelContractError::Slots(_))
        ));

        // Missing outputs
        assert!(matches!(
            handle.extract(&[]),
            Err(ModelContractError::IndexOutOfRange { .. })
        ));

        Ok(())
    }
}
