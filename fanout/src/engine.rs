use std::sync::{Arc, OnceLock};

use crate::{
    config::ConfigStore,
    dispatch::{Dispatcher, Parallel},
    error::{Error, Result},
    registry::PoolRegistry,
    settings::Options,
};

/// Ties configuration and pools together and hands out dispatchers.
///
/// Most programs need one engine. Tests and embedders can build several, each
/// with its own configuration and pools.
///
/// ```
/// use fanout::{Engine, Options};
///
/// let engine = Engine::default();
/// let double = engine
///     .parallel(&Options::builder().workers(4).build(), |x: u32| x * 2)
///     .unwrap();
/// assert_eq!(double.call(vec![1, 2, 3]).unwrap(), vec![2, 4, 6]);
/// ```
#[derive(Debug, Clone)]
pub struct Engine {
    config: Arc<ConfigStore>,
    registry: Arc<PoolRegistry>,
}

impl Default for Engine {
    /// Built-in defaults, no environment layer.
    fn default() -> Self {
        Self::new(Arc::new(ConfigStore::default()), Arc::new(PoolRegistry::new()))
    }
}

impl Engine {
    pub fn new(config: Arc<ConfigStore>, registry: Arc<PoolRegistry>) -> Self {
        Self { config, registry }
    }

    /// An engine configured from the `FANOUT_*` environment.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(
            Arc::new(ConfigStore::from_env()?),
            Arc::new(PoolRegistry::new()),
        ))
    }

    /// The process-wide engine used by `#[parallel]` functions, built from the
    /// environment on first use.
    ///
    /// A configuration error is returned on every call, not only the first,
    /// with the same variant each time.
    pub fn global() -> Result<&'static Engine> {
        static GLOBAL: OnceLock<Result<Engine>> = OnceLock::new();
        GLOBAL
            .get_or_init(Engine::from_env)
            .as_ref()
            .map_err(replay)
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    /// A dispatcher whose settings are `options` resolved against this
    /// engine's configuration.
    pub fn dispatcher(&self, options: &Options) -> Result<Dispatcher> {
        let settings = self.config.resolve(options)?;
        Dispatcher::new(settings, Arc::clone(&self.registry))
    }

    /// Binds `f` to a dispatcher.
    ///
    /// Fails if the settings ask for a process pool, which cannot run
    /// closures.
    pub fn parallel<F>(&self, options: &Options, f: F) -> Result<Parallel<F>> {
        let dispatcher = self.dispatcher(options)?;
        dispatcher.ensure_in_process()?;
        Ok(Parallel::new(dispatcher, f))
    }

    /// Binds a method of `receiver` to a dispatcher. Every task borrows the
    /// same receiver.
    pub fn method<S, T, R, F>(
        &self,
        options: &Options,
        receiver: Arc<S>,
        f: F,
    ) -> Result<Parallel<impl Fn(T) -> R + Send + Sync + 'static>>
    where
        S: Send + Sync + 'static,
        F: Fn(&S, T) -> R + Send + Sync + 'static,
    {
        self.parallel(options, move |item: T| f(&receiver, item))
    }
}

/// Rebuilds a cached startup error. Only configuration errors come out of
/// [`Engine::from_env`].
fn replay(err: &Error) -> Error {
    match err {
        Error::ConfigFile { path, message } => Error::ConfigFile {
            path: path.clone(),
            message: message.clone(),
        },
        Error::Config(message) => Error::Config(message.clone()),
        other => Error::config(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        pool::ProcessCommand,
        settings::ExecutorKind,
    };

    fn engine(env: Options) -> Engine {
        Engine::new(
            Arc::new(ConfigStore::with_env(Config::default(), env).unwrap()),
            Arc::new(PoolRegistry::with_command(ProcessCommand::new("unused"))),
        )
    }

    #[test]
    fn settings_are_resolved_once_at_construction() {
        let engine = engine(Options::default());
        let parallel = engine
            .parallel(&Options::builder().workers(3).build(), |x: i32| x + 1)
            .unwrap();
        engine
            .config()
            .update(|cfg| cfg.execution.batch_size = 99)
            .unwrap();
        assert_eq!(parallel.settings().workers, 3);
        assert_eq!(parallel.settings().batch_size, 10);
    }

    #[test]
    fn parallels_with_the_same_key_share_a_pool() {
        let engine = engine(Options::default());
        let options = Options::builder().workers(2).build();
        let a = engine.parallel(&options, |x: i32| x).unwrap();
        let b = engine.parallel(&options, |x: i32| -x).unwrap();
        assert_eq!(a.call(vec![1, 2]).unwrap(), vec![1, 2]);
        assert_eq!(b.call(vec![1, 2]).unwrap(), vec![-1, -2]);
        assert_eq!(engine.registry().pools_created(), 1);
    }

    #[test]
    fn process_closures_fail_at_construction() {
        let engine = engine(Options::builder().executor(ExecutorKind::Process).build());
        let err = engine.parallel(&Options::default(), |x: i32| x).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn methods_bind_their_receiver() {
        struct Scaler {
            factor: i64,
        }

        let engine = engine(Options::default());
        let scale = engine
            .method(
                &Options::builder().workers(2).build(),
                Arc::new(Scaler { factor: 3 }),
                |s: &Scaler, x: i64| s.factor * x,
            )
            .unwrap();
        assert_eq!(scale.call(vec![1, 2, 3]).unwrap(), vec![3, 6, 9]);
        assert_eq!(scale.call(5).unwrap(), vec![15]);
    }

    #[test]
    fn cached_startup_errors_keep_their_variant() {
        let err = ConfigStore::from_vars([("FANOUT_CONFIG", "/nonexistent/fanout.toml")])
            .map(|_| ())
            .unwrap_err();
        match replay(&err) {
            Error::ConfigFile { path, .. } => {
                assert_eq!(path, std::path::PathBuf::from("/nonexistent/fanout.toml"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let err = ConfigStore::from_vars([("FANOUT_WORKERS", "lots")])
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(replay(&err), Error::Config(msg) if msg.contains("FANOUT_WORKERS")));
    }

    #[test]
    fn invalid_options_are_rejected() {
        let engine = engine(Options::default());
        assert!(
            engine
                .dispatcher(&Options::builder().batch_size(0).build())
                .is_err()
        );
    }
}
