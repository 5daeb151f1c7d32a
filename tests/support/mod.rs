#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use giffy::{CodecEngine, DirEntry, EngineError, EngineEvent, LoadStage};

/// What a scripted engine should do. Shared by every engine a factory makes.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Fail this many loads before succeeding.
    pub fail_loads: usize,
    /// Fail the n-th exec (0-based, counted across the whole test).
    pub fail_exec: Option<usize>,
    /// Produce a zero-byte output file.
    pub empty_output: bool,
    /// Never return from the n-th exec.
    pub hang_exec: Option<usize>,
    /// Delay between progress events.
    pub step: Duration,
}

/// Everything a test may want to look at after the fact.
#[derive(Debug, Default)]
pub struct Recorder {
    pub fs: Mutex<BTreeMap<String, Vec<u8>>>,
    pub ops: Mutex<Vec<String>>,
    pub argv: Mutex<Vec<Vec<String>>>,
    pub loads: AtomicUsize,
    pub execs: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl Recorder {
    pub fn files(&self) -> Vec<String> {
        self.fs.lock().unwrap().keys().cloned().collect()
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn argv(&self) -> Vec<Vec<String>> {
        self.argv.lock().unwrap().clone()
    }

    fn record(&self, op: impl Into<String>) {
        self.ops.lock().unwrap().push(op.into());
    }
}

pub struct ScriptedEngine {
    recorder: Arc<Recorder>,
    script: Script,
    loaded: bool,
}

pub fn factory(
    recorder: Arc<Recorder>,
    script: Script,
) -> impl Fn() -> ScriptedEngine + Send + Sync + 'static {
    move || ScriptedEngine {
        recorder: recorder.clone(),
        script: script.clone(),
        loaded: false,
    }
}

/// Bytes an exec writes for `name`. GIF outputs get a real header.
pub fn fake_output(name: &str) -> Vec<u8> {
    if name.ends_with(".gif") {
        b"GIF89a-scripted".to_vec()
    } else {
        format!("scripted:{name}").into_bytes()
    }
}

pub fn source(len: usize) -> Arc<[u8]> {
    vec![0x42u8; len].into()
}

impl ScriptedEngine {
    fn ensure_loaded(&self) -> Result<(), EngineError> {
        if self.loaded {
            Ok(())
        } else {
            Err(EngineError::NotLoaded)
        }
    }

    async fn pause(&self) {
        if self.script.step.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.script.step).await;
        }
    }
}

impl CodecEngine for ScriptedEngine {
    async fn load(&mut self, on_stage: &mut (dyn FnMut(LoadStage) + Send)) -> Result<(), EngineError> {
        let attempt = self.recorder.loads.fetch_add(1, Ordering::SeqCst);
        self.recorder.record("load");
        on_stage(LoadStage::Started);
        self.pause().await;
        on_stage(LoadStage::CoreReady);
        on_stage(LoadStage::RuntimeReady);
        if attempt < self.script.fail_loads {
            return Err(EngineError::Load("failed to fetch core".into()));
        }
        on_stage(LoadStage::Initialized);
        self.loaded = true;
        Ok(())
    }

    async fn exec(
        &mut self,
        argv: &[String],
        on_event: &mut (dyn FnMut(EngineEvent) + Send),
    ) -> Result<(), EngineError> {
        self.ensure_loaded()?;
        let index = self.recorder.execs.fetch_add(1, Ordering::SeqCst);
        self.recorder.record("exec");
        self.recorder.argv.lock().unwrap().push(argv.to_vec());

        let active = self.recorder.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.recorder.max_active.fetch_max(active, Ordering::SeqCst);

        let result = async {
            let inputs: Vec<&String> = argv
                .windows(2)
                .filter(|w| w[0] == "-i")
                .map(|w| &w[1])
                .collect();
            for input in inputs {
                if !self.recorder.fs.lock().unwrap().contains_key(input.as_str()) {
                    return Err(EngineError::Exec(format!("{input}: No such file or directory")));
                }
            }
            let output = argv.last().cloned().unwrap_or_default();

            if self.script.hang_exec == Some(index) {
                std::future::pending::<()>().await;
            }

            on_event(EngineEvent::Log("scripted engine starting".into()));
            for fraction in [0.0, 0.25, 0.5, 0.75] {
                on_event(EngineEvent::Progress(fraction));
                self.pause().await;
            }

            if self.script.fail_exec == Some(index) {
                // Leave a partial file behind like a real crash would.
                self.recorder.fs.lock().unwrap().insert(output, vec![1, 2, 3]);
                return Err(EngineError::Exec("Out of memory".into()));
            }

            let bytes = if self.script.empty_output {
                Vec::new()
            } else {
                fake_output(&output)
            };
            self.recorder.fs.lock().unwrap().insert(output, bytes);
            on_event(EngineEvent::Progress(1.0));
            Ok(())
        }
        .await;

        self.recorder.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn write_file(&mut self, name: &str, bytes: &[u8]) -> Result<(), EngineError> {
        self.ensure_loaded()?;
        self.recorder.record(format!("write {name}"));
        self.recorder
            .fs
            .lock()
            .unwrap()
            .insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn read_file(&mut self, name: &str) -> Result<Vec<u8>, EngineError> {
        self.ensure_loaded()?;
        self.recorder.record(format!("read {name}"));
        self.recorder
            .fs
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(name.to_string()))
    }

    async fn delete_file(&mut self, name: &str) -> Result<(), EngineError> {
        self.recorder.record(format!("delete {name}"));
        match self.recorder.fs.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(EngineError::NotFound(name.to_string())),
        }
    }

    async fn list_dir(&mut self, _path: &str) -> Result<Vec<DirEntry>, EngineError> {
        let mut entries = vec![
            DirEntry {
                name: ".".into(),
                is_dir: true,
            },
            DirEntry {
                name: "..".into(),
                is_dir: true,
            },
            DirEntry {
                name: "tmp".into(),
                is_dir: true,
            },
        ];
        entries.extend(self.recorder.files().into_iter().map(|name| DirEntry {
            name,
            is_dir: false,
        }));
        Ok(entries)
    }
}

/// Debug-level fmt subscriber on the test writer; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
