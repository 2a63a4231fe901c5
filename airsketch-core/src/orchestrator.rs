use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::{
    codec, preprocess, DeviceKind, GenerateError, GenerationRequest, ModelManager, PipelineCall,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationMetadata {
    pub prompt: String,
    pub steps: usize,
    pub guidance_scale: f64,
    pub device: DeviceKind,
    /// Output `[width, height]` in pixels.
    pub size: [u32; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    /// PNG as a `data:image/png;base64,` URI.
    pub image_base64: String,
    pub metadata: GenerationMetadata,
}

/// Drives one sketch-to-image request end to end.
///
/// `generate` blocks for the whole inference; async callers should run it on
/// a blocking thread.
#[derive(Clone)]
pub struct Generator {
    manager: Arc<ModelManager>,
}

impl Generator {
    pub fn new(manager: Arc<ModelManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<ModelManager> {
        &self.manager
    }

    pub fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult, GenerateError> {
        request.validate()?;

        let sketch = codec::decode_image(&request.sketch_base64)?;
        info!("received sketch: {}x{}", sketch.width(), sketch.height());

        debug!("preprocessing sketch with canny edge detection");
        let conditioning = preprocess::conditioning_image(&sketch);

        let mut lease = self.manager.acquire()?;
        let profile = lease.profile().clone();
        let precision = profile.dtype;
        info!(
            device = %profile.kind,
            precision = ?precision,
            "generating with prompt {:?}, {} steps",
            request.prompt,
            request.num_inference_steps
        );

        let start = Instant::now();
        let output = lease
            .run(PipelineCall {
                prompt: &request.prompt,
                negative_prompt: &request.negative_prompt,
                conditioning: &conditioning,
                steps: request.num_inference_steps,
                guidance_scale: request.guidance_scale,
                conditioning_scale: request.controlnet_conditioning_scale,
                seed: request.seed,
                precision,
            })
            .map_err(GenerateError::inference)?;
        drop(lease);

        let steps = output.steps;
        let image = output
            .images
            .into_iter()
            .next()
            .ok_or_else(|| GenerateError::Inference("pipeline returned no images".to_string()))?;
        let image_base64 = codec::encode_png_data_uri(&image).map_err(GenerateError::inference)?;
        info!(
            "image generated in {:.1}s ({}x{})",
            start.elapsed().as_secs_f64(),
            image.width(),
            image.height()
        );

        Ok(GenerationResult {
            image_base64,
            metadata: GenerationMetadata {
                prompt: request.prompt.clone(),
                steps,
                guidance_scale: request.guidance_scale,
                device: profile.kind,
                size: [image.width(), image.height()],
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::{decode_image, encode_png_data_uri, strip_data_uri},
        preprocess::CONDITIONING_SIZE,
        DeviceMap, ExecutionProfile, Loader, Pipeline, PipelineOutput,
    };
    use candle_core::DType;
    use image::{DynamicImage, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    type Intervals = Arc<Mutex<Vec<(Instant, Instant)>>>;

    /// Echoes the conditioning image back and records its call window and precision.
    struct StubPipeline {
        intervals: Intervals,
        precisions: Arc<Mutex<Vec<DType>>>,
        delay: Duration,
        fail_with: Option<&'static str>,
    }

    impl Pipeline for StubPipeline {
        fn run(&mut self, call: PipelineCall<'_>) -> anyhow::Result<PipelineOutput> {
            self.precisions.lock().unwrap().push(call.precision);
            let entered = Instant::now();
            std::thread::sleep(self.delay);
            let exited = Instant::now();
            self.intervals.lock().unwrap().push((entered, exited));
            if let Some(message) = self.fail_with {
                anyhow::bail!(message);
            }
            Ok(PipelineOutput {
                images: vec![DynamicImage::ImageRgb8(call.conditioning.clone())],
                steps: call.steps,
            })
        }
    }

    #[derive(Clone)]
    struct StubLoader {
        loads: Arc<AtomicUsize>,
        intervals: Intervals,
        precisions: Arc<Mutex<Vec<DType>>>,
        delay: Duration,
        load_fails: bool,
        run_fails: Option<&'static str>,
    }

    impl StubLoader {
        fn new() -> Self {
            Self {
                loads: Arc::default(),
                intervals: Arc::default(),
                precisions: Arc::default(),
                delay: Duration::ZERO,
                load_fails: false,
                run_fails: None,
            }
        }
    }

    impl Loader for StubLoader {
        fn load(&self, _profile: &ExecutionProfile) -> anyhow::Result<Box<dyn Pipeline>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.load_fails {
                anyhow::bail!("insufficient memory");
            }
            Ok(Box::new(StubPipeline {
                intervals: self.intervals.clone(),
                precisions: self.precisions.clone(),
                delay: self.delay,
                fail_with: self.run_fails,
            }))
        }
    }

    fn generator(loader: StubLoader) -> Generator {
        Generator::new(Arc::new(ModelManager::new(loader, DeviceMap::ForceCpu)))
    }

    fn sketch_uri() -> String {
        let mut img = RgbImage::from_pixel(320, 240, image::Rgb([255, 255, 255]));
        for x in 60..260 {
            img.put_pixel(x, 120, image::Rgb([0, 0, 0]));
            img.put_pixel(x, 121, image::Rgb([0, 0, 0]));
        }
        encode_png_data_uri(&DynamicImage::ImageRgb8(img)).unwrap()
    }

    #[test]
    fn default_request_echoes_resolved_metadata() {
        let result = generator(StubLoader::new())
            .generate(&GenerationRequest::new(sketch_uri()))
            .unwrap();
        assert_eq!(
            result.metadata,
            GenerationMetadata {
                prompt: "a beautiful photograph".to_string(),
                steps: 20,
                guidance_scale: 7.5,
                device: DeviceKind::Cpu,
                size: [512, 512],
            }
        );
        assert!(result.image_base64.starts_with("data:image/png;base64,"));
        let decoded = decode_image(&result.image_base64).unwrap();
        assert_eq!(decoded.width(), CONDITIONING_SIZE);
    }

    #[test]
    fn cpu_generation_runs_at_full_precision() {
        let loader = StubLoader::new();
        let generator = generator(loader.clone());
        for _ in 0..2 {
            generator.generate(&GenerationRequest::new(sketch_uri())).unwrap();
        }
        assert_eq!(*loader.precisions.lock().unwrap(), vec![DType::F32, DType::F32]);
    }

    #[test]
    fn bare_base64_sketch_is_accepted() {
        let uri = sketch_uri();
        let req = GenerationRequest::new(strip_data_uri(&uri));
        assert!(generator(StubLoader::new()).generate(&req).is_ok());
    }

    #[test]
    fn undecodable_sketch_never_reaches_the_manager() {
        let loader = StubLoader::new();
        let generator = generator(loader.clone());
        let err = generator
            .generate(&GenerationRequest::new("data:image/png;base64,bm90IGFuIGltYWdl"))
            .unwrap_err();
        assert!(matches!(err, GenerateError::Decode(_)));
        assert_eq!(loader.loads.load(Ordering::SeqCst), 0);
        assert!(!generator.manager().is_loaded());
    }

    #[test]
    fn invalid_parameters_never_reach_the_manager() {
        let loader = StubLoader::new();
        let req = GenerationRequest {
            num_inference_steps: 0,
            ..GenerationRequest::new(sketch_uri())
        };
        let err = generator(loader.clone()).generate(&req).unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
        assert_eq!(loader.loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failing_construction_surfaces_model_unavailable_every_time() {
        let loader = StubLoader {
            load_fails: true,
            ..StubLoader::new()
        };
        let generator = generator(loader.clone());
        for _ in 0..3 {
            let err = generator.generate(&GenerationRequest::new(sketch_uri())).unwrap_err();
            assert!(matches!(err, GenerateError::ModelUnavailable(ref m) if m.contains("insufficient memory")));
        }
        assert_eq!(loader.loads.load(Ordering::SeqCst), 3);
        assert!(!generator.manager().is_loaded());
    }

    #[test]
    fn pipeline_failure_is_wrapped_as_inference_error() {
        let loader = StubLoader {
            run_fails: Some("numeric overflow in step 7"),
            ..StubLoader::new()
        };
        let err = generator(loader)
            .generate(&GenerationRequest::new(sketch_uri()))
            .unwrap_err();
        assert_eq!(
            err,
            GenerateError::Inference("numeric overflow in step 7".to_string())
        );
    }

    #[test]
    fn concurrent_generations_never_overlap() {
        let loader = StubLoader {
            delay: Duration::from_millis(30),
            ..StubLoader::new()
        };
        let generator = generator(loader.clone());
        let sketch = sketch_uri();
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let generator = generator.clone();
                let req = GenerationRequest::new(sketch.clone());
                std::thread::spawn(move || generator.generate(&req).map(|_| ()))
            })
            .collect();
        for t in threads {
            t.join().unwrap().unwrap();
        }

        let mut intervals = loader.intervals.lock().unwrap().clone();
        assert_eq!(intervals.len(), 4);
        intervals.sort();
        for pair in intervals.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "inference windows overlap: {pair:?}");
        }
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }
}
