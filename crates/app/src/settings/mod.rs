pub mod state;

pub use state::{
    CalendarSettings, ProviderSettings, RouterSettings, ScriptSettings, Settings, SettingsError,
    SettingsStore,
};
