pub mod shared {
    pub mod aspect_fill;
    pub mod constants;
    pub mod progress;
    pub mod sample_buffer;
    pub mod source_asset;
    pub mod track_info;
}

pub mod asset {
    pub mod domain {
        pub mod asset_materializer;
    }
    pub mod infrastructure {
        pub mod temp_file_materializer;
    }
}

pub mod media {
    pub mod domain {
        pub mod demux_session;
        pub mod media_backend;
        pub mod mux_session;
    }
    pub mod infrastructure;
}

pub mod transcode {
    pub mod compress_error;
    pub mod compress_options;
    pub mod compressor;
    pub mod output_locator;
    #[cfg(test)]
    pub(crate) mod stub_backend;
    pub mod track_copy_loop;
}
