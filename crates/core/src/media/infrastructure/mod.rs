pub mod ffmpeg_backend;
pub mod ffmpeg_demux_session;
pub mod ffmpeg_mux_session;
#[cfg(test)]
pub(crate) mod test_clip;
