//! Repository layer over the SQLite pool.
//!
//! All persistent-entity access from the core goes through [`Repository`];
//! handlers and the EPG ingester never issue raw queries. Errors collapse to
//! the three kinds callers can act on: not-found, conflict, unavailable.

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::db::connection::{DbPool, DbPooledConnection};
use crate::db::models::{
    Channel, EpgChannel, EpgProgram, EpgSource, FfmpegProfile, NewChannel, NewEpgChannel,
    NewEpgProgram, NewEpgSource, NewStream, Setting, Stream,
};
use crate::db::schema::{
    channels, epg_channels, epg_programs, epg_sources, ffmpeg_profiles, settings, streams,
};

/// Error kinds surfaced by repository calls.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<diesel::result::Error> for RepositoryError {
    fn from(err: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error};
        match err {
            Error::NotFound => RepositoryError::NotFound,
            Error::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                RepositoryError::Conflict(info.message().to_string())
            }
            Error::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, info) => {
                RepositoryError::Conflict(info.message().to_string())
            }
            other => RepositoryError::Unavailable(other.to_string()),
        }
    }
}

impl From<r2d2::Error> for RepositoryError {
    fn from(err: r2d2::Error) -> Self {
        RepositoryError::Unavailable(err.to_string())
    }
}

/// Half-open UTC window used for program queries and windowed replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramWindow {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
}

impl ProgramWindow {
    pub fn new(start: DateTime<Utc>, stop: DateTime<Utc>) -> Self {
        Self { start, stop }
    }

    fn start_str(&self) -> String {
        format_utc(self.start)
    }

    fn stop_str(&self) -> String {
        format_utc(self.stop)
    }
}

/// Canonical storage format for program timestamps. RFC 3339 UTC with seconds
/// precision sorts lexicographically, so string comparison in SQL is correct.
pub fn format_utc(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Everything needed to assemble the filtered XMLTV emission.
#[derive(Debug, Clone)]
pub struct EmissionData {
    /// Configured channels that carry an `epg_id`.
    pub channels: Vec<Channel>,
    /// Guide channel metadata joined on those ids.
    pub epg_channels: Vec<EpgChannel>,
    /// Programs overlapping the requested window, ordered per channel.
    pub programs: Vec<EpgProgram>,
}

const PROGRAM_BATCH_SIZE: usize = 1000;

#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<DbPooledConnection, RepositoryError> {
        Ok(self.pool.get()?)
    }

    // ------------------------------------------------------------------
    // Channels and streams
    // ------------------------------------------------------------------

    pub fn list_enabled_channels(&self) -> Result<Vec<Channel>, RepositoryError> {
        let mut conn = self.conn()?;
        Ok(channels::table
            .filter(channels::enabled.eq(1))
            .order(channels::number.asc())
            .load::<Channel>(&mut conn)?)
    }

    pub fn get_channel_by_number(&self, number: i32) -> Result<Channel, RepositoryError> {
        let mut conn = self.conn()?;
        Ok(channels::table
            .filter(channels::number.eq(number))
            .first::<Channel>(&mut conn)?)
    }

    pub fn get_channel_by_id(&self, id: i32) -> Result<Channel, RepositoryError> {
        let mut conn = self.conn()?;
        Ok(channels::table.find(id).first::<Channel>(&mut conn)?)
    }

    /// Streams for a channel in insertion order.
    pub fn list_streams_for_channel(&self, channel_id: i32) -> Result<Vec<Stream>, RepositoryError> {
        let mut conn = self.conn()?;
        Ok(streams::table
            .filter(streams::channel_id.eq(channel_id))
            .order(streams::id.asc())
            .load::<Stream>(&mut conn)?)
    }

    // ------------------------------------------------------------------
    // FFmpeg profiles
    // ------------------------------------------------------------------

    pub fn get_ffmpeg_profile(&self, id: i32) -> Result<FfmpegProfile, RepositoryError> {
        let mut conn = self.conn()?;
        Ok(ffmpeg_profiles::table
            .find(id)
            .first::<FfmpegProfile>(&mut conn)?)
    }

    pub fn get_default_profile(&self) -> Result<FfmpegProfile, RepositoryError> {
        let mut conn = self.conn()?;
        Ok(ffmpeg_profiles::table
            .filter(ffmpeg_profiles::is_default.eq(1))
            .first::<FfmpegProfile>(&mut conn)?)
    }

    /// Delete a profile. The default profile and system profiles are
    /// protected; deleting them is a conflict, not a no-op.
    pub fn delete_profile(&self, id: i32) -> Result<(), RepositoryError> {
        let mut conn = self.conn()?;
        let profile = ffmpeg_profiles::table
            .find(id)
            .first::<FfmpegProfile>(&mut conn)?;

        if profile.is_system() {
            return Err(RepositoryError::Conflict(
                "system profiles cannot be deleted".into(),
            ));
        }
        if profile.is_default() {
            return Err(RepositoryError::Conflict(
                "the default profile cannot be deleted".into(),
            ));
        }

        diesel::delete(ffmpeg_profiles::table.find(id)).execute(&mut conn)?;
        Ok(())
    }

    /// Move the default flag to another profile. Swaps atomically so exactly
    /// one profile holds `is_default` at all times.
    pub fn set_default_profile(&self, id: i32) -> Result<(), RepositoryError> {
        let mut conn = self.conn()?;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            // Verify the target exists before clearing the current default.
            let _ = ffmpeg_profiles::table
                .find(id)
                .first::<FfmpegProfile>(conn)?;

            diesel::update(ffmpeg_profiles::table.filter(ffmpeg_profiles::is_default.eq(1)))
                .set(ffmpeg_profiles::is_default.eq(0))
                .execute(conn)?;
            diesel::update(ffmpeg_profiles::table.find(id))
                .set(ffmpeg_profiles::is_default.eq(1))
                .execute(conn)?;
            Ok(())
        })?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // EPG sources
    // ------------------------------------------------------------------

    pub fn list_epg_sources(&self) -> Result<Vec<EpgSource>, RepositoryError> {
        let mut conn = self.conn()?;
        Ok(epg_sources::table
            .order(epg_sources::id.asc())
            .load::<EpgSource>(&mut conn)?)
    }

    pub fn list_enabled_epg_sources(&self) -> Result<Vec<EpgSource>, RepositoryError> {
        let mut conn = self.conn()?;
        Ok(epg_sources::table
            .filter(epg_sources::enabled.eq(1))
            .order(epg_sources::id.asc())
            .load::<EpgSource>(&mut conn)?)
    }

    pub fn mark_epg_source_success(&self, source_id: i32) -> Result<(), RepositoryError> {
        let mut conn = self.conn()?;
        let now = format_utc(Utc::now());
        diesel::update(epg_sources::table.find(source_id))
            .set((
                epg_sources::last_success.eq(Some(now.clone())),
                epg_sources::last_error.eq(None::<String>),
                epg_sources::updated_at.eq(now),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    pub fn mark_epg_source_error(
        &self,
        source_id: i32,
        message: &str,
    ) -> Result<(), RepositoryError> {
        let mut conn = self.conn()?;
        diesel::update(epg_sources::table.find(source_id))
            .set((
                epg_sources::last_error.eq(Some(message.to_string())),
                epg_sources::updated_at.eq(format_utc(Utc::now())),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // EPG channels and programs
    // ------------------------------------------------------------------

    pub fn upsert_epg_channel(&self, row: &NewEpgChannel) -> Result<(), RepositoryError> {
        let mut conn = self.conn()?;
        diesel::insert_into(epg_channels::table)
            .values(row)
            .on_conflict((epg_channels::source_id, epg_channels::epg_id))
            .do_update()
            .set((
                epg_channels::display_name.eq(&row.display_name),
                epg_channels::icon_url.eq(&row.icon_url),
                epg_channels::updated_at.eq(&row.updated_at),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    /// Windowed replacement: drop stored programs for `(source_id, epg_id)`
    /// that overlap the ingested window, then insert the new rows in batches
    /// of [`PROGRAM_BATCH_SIZE`] per transaction.
    pub fn replace_epg_programs(
        &self,
        source_id: i32,
        epg_id: &str,
        window: ProgramWindow,
        rows: &[NewEpgProgram],
    ) -> Result<usize, RepositoryError> {
        let mut conn = self.conn()?;
        let (win_start, win_stop) = (window.start_str(), window.stop_str());

        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            diesel::delete(
                epg_programs::table
                    .filter(epg_programs::source_id.eq(source_id))
                    .filter(epg_programs::epg_id.eq(epg_id))
                    .filter(epg_programs::start_utc.lt(&win_stop))
                    .filter(epg_programs::stop_utc.gt(&win_start)),
            )
            .execute(conn)?;
            Ok(())
        })?;

        let mut inserted = 0;
        for chunk in rows.chunks(PROGRAM_BATCH_SIZE) {
            inserted += conn.transaction::<_, diesel::result::Error, _>(|conn| {
                diesel::insert_into(epg_programs::table)
                    .values(chunk)
                    .execute(conn)
            })?;
        }

        Ok(inserted)
    }

    /// Collect everything the XMLTV emitter needs: configured channels with an
    /// `epg_id`, guide channel metadata for those ids, and programs
    /// overlapping the window ordered per channel.
    pub fn query_epg_for_emission(
        &self,
        window: ProgramWindow,
    ) -> Result<EmissionData, RepositoryError> {
        let mut conn = self.conn()?;

        let mapped: Vec<Channel> = channels::table
            .filter(channels::epg_id.is_not_null())
            .order(channels::number.asc())
            .load::<Channel>(&mut conn)?;

        let epg_ids: Vec<&String> = mapped.iter().filter_map(|c| c.epg_id.as_ref()).collect();
        if epg_ids.is_empty() {
            return Ok(EmissionData {
                channels: mapped,
                epg_channels: Vec::new(),
                programs: Vec::new(),
            });
        }

        let guide_channels = epg_channels::table
            .filter(epg_channels::epg_id.eq_any(&epg_ids))
            .order(epg_channels::epg_id.asc())
            .load::<EpgChannel>(&mut conn)?;

        let (win_start, win_stop) = (window.start_str(), window.stop_str());
        let programs = epg_programs::table
            .filter(epg_programs::epg_id.eq_any(&epg_ids))
            .filter(epg_programs::start_utc.lt(win_stop))
            .filter(epg_programs::stop_utc.gt(win_start))
            .order((epg_programs::epg_id.asc(), epg_programs::start_utc.asc()))
            .load::<EpgProgram>(&mut conn)?;

        Ok(EmissionData {
            channels: mapped,
            epg_channels: guide_channels,
            programs,
        })
    }

    /// Programs stored for one guide channel, in start order.
    pub fn list_programs_for_epg_id(
        &self,
        source_id: i32,
        epg_id: &str,
    ) -> Result<Vec<EpgProgram>, RepositoryError> {
        let mut conn = self.conn()?;
        Ok(epg_programs::table
            .filter(epg_programs::source_id.eq(source_id))
            .filter(epg_programs::epg_id.eq(epg_id))
            .order(epg_programs::start_utc.asc())
            .load::<EpgProgram>(&mut conn)?)
    }

    pub fn list_epg_channels_for_source(
        &self,
        source_id: i32,
    ) -> Result<Vec<EpgChannel>, RepositoryError> {
        let mut conn = self.conn()?;
        Ok(epg_channels::table
            .filter(epg_channels::source_id.eq(source_id))
            .order(epg_channels::epg_id.asc())
            .load::<EpgChannel>(&mut conn)?)
    }

    // ------------------------------------------------------------------
    // Settings (key/value)
    // ------------------------------------------------------------------

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, RepositoryError> {
        let mut conn = self.conn()?;
        Ok(settings::table
            .find(key)
            .first::<Setting>(&mut conn)
            .optional()?
            .map(|s| s.value))
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), RepositoryError> {
        let mut conn = self.conn()?;
        diesel::insert_into(settings::table)
            .values(Setting::new(key, value))
            .on_conflict(settings::key)
            .do_update()
            .set(settings::value.eq(value))
            .execute(&mut conn)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Entity creation (external CRUD surface; the core reads only)
    // ------------------------------------------------------------------

    pub fn insert_channel(&self, row: &NewChannel) -> Result<Channel, RepositoryError> {
        let mut conn = self.conn()?;
        Ok(diesel::insert_into(channels::table)
            .values(row)
            .get_result::<Channel>(&mut conn)?)
    }

    pub fn insert_stream(&self, row: &NewStream) -> Result<Stream, RepositoryError> {
        let mut conn = self.conn()?;
        Ok(diesel::insert_into(streams::table)
            .values(row)
            .get_result::<Stream>(&mut conn)?)
    }

    pub fn insert_epg_source(&self, row: &NewEpgSource) -> Result<EpgSource, RepositoryError> {
        let mut conn = self.conn()?;
        Ok(diesel::insert_into(epg_sources::table)
            .values(row)
            .get_result::<EpgSource>(&mut conn)?)
    }
}
