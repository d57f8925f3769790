/// Vsock port the host's proxy connects to.
pub const AGENT_PORT: u32 = 5000;

/// Block device the host attaches the dependency image on, when present.
pub const DEPS_DEVICE: &str = "/dev/vdb";
pub const DEPS_MOUNT_POINT: &str = "/mnt/deps";

/// Where the strategy source and generated runner are written for each run.
pub const STRATEGY_PATH: &str = "/tmp/strategy.py";
pub const RUNNER_PATH: &str = "/tmp/runner.py";

/// Directory the backtesting engine and its historical data ship in.
pub const ENGINE_PYTHONPATH: &str = "/code";

pub const RUNNER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5 * 60);

/// Embedded driver script: loads the user's `Strategy` class, runs it
/// against the bundled backtesting engine, and prints exactly one JSON
/// line (`{"status": "success", "report": ...}` or `{"status": "error",
/// "error": ...}`) to stdout.
pub const RUNNER_STUB: &str = r#"
import sys
import json
import os
import traceback
import importlib.util
import numpy as np


class NumpyEncoder(json.JSONEncoder):
    def default(self, obj):
        if isinstance(obj, np.ndarray):
            return obj.tolist()
        return super().default(obj)


def load_strategy(path):
    spec = importlib.util.spec_from_file_location("user_module", path)
    mod = importlib.util.module_from_spec(spec)
    spec.loader.exec_module(mod)
    return mod.Strategy


def main():
    try:
        try:
            from tradekit_rust import BacktestEngine
        except ImportError:
            print(json.dumps({
                "status": "error",
                "error": f"Rust Engine not found. PYTHONPATH is: {sys.path}"
            }))
            return

        StrategyClass = load_strategy("/tmp/strategy.py")
        strategy_instance = StrategyClass()
        duration = getattr(strategy_instance, "MAX_DURATION", 30)
        data_path = os.getenv("DATA_PATH", "/code/historical_data")

        engine = BacktestEngine(strategy_instance, duration, data_path, 0.0)
        report = engine.run()

        print(json.dumps({"status": "success", "report": report}, cls=NumpyEncoder))

    except Exception:
        print(json.dumps({"status": "error", "error": traceback.format_exc()}))


if __name__ == "__main__":
    main()
"#;
