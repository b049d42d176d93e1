pub mod connection;
pub mod models;
pub mod repository;
pub mod schema;

pub use connection::{
    create_pool, establish_connection, get_db_path, run_migrations, DbPool, DbPooledConnection,
};
pub use models::{
    Channel, ClientKind, ClientProfile, EpgChannel, EpgProgram, EpgSource, FfmpegProfile,
    NewChannel, NewEpgChannel, NewEpgProgram, NewEpgSource, NewStream, Setting, Stream, StreamKind,
};
pub use repository::{EmissionData, ProgramWindow, Repository, RepositoryError};
