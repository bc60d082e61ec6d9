// Schema definitions for the Glacis gateway database.

diesel::table! {
    persons (id) {
        id -> Int4,
        #[max_length = 255]
        handle -> Varchar,
        #[max_length = 255]
        display_name -> Varchar,
        #[max_length = 255]
        email -> Nullable<Varchar>,
        active -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    source_ips (id) {
        id -> Int4,
        person_id -> Int4,
        cidr -> Inet,
        #[max_length = 255]
        label -> Nullable<Varchar>,
        active -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    backends (id) {
        id -> Int4,
        #[max_length = 255]
        name -> Varchar,
        #[max_length = 255]
        address -> Varchar,
        ssh_port -> Int4,
        rdp_port -> Int4,
        ssh_enabled -> Bool,
        rdp_enabled -> Bool,
        active -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    allocations (id) {
        id -> Int4,
        proxy_ip -> Inet,
        backend_id -> Int4,
        created_at -> Timestamptz,
        released_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    server_groups (id) {
        id -> Int4,
        #[max_length = 255]
        name -> Varchar,
        parent_id -> Nullable<Int4>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    server_group_members (id) {
        id -> Int4,
        group_id -> Int4,
        backend_id -> Int4,
    }
}

diesel::table! {
    user_groups (id) {
        id -> Int4,
        #[max_length = 255]
        name -> Varchar,
        parent_id -> Nullable<Int4>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    user_group_members (id) {
        id -> Int4,
        group_id -> Int4,
        person_id -> Int4,
    }
}

diesel::table! {
    policies (id) {
        id -> Int4,
        #[max_length = 20]
        subject_kind -> Varchar,
        subject_id -> Int4,
        #[max_length = 20]
        scope_kind -> Varchar,
        scope_id -> Int4,
        #[max_length = 10]
        protocol -> Nullable<Varchar>,
        ssh_logins -> Array<Text>,
        source_ip_id -> Nullable<Int4>,
        allow_port_forwarding -> Bool,
        starts_at -> Timestamptz,
        ends_at -> Nullable<Timestamptz>,
        schedule -> Nullable<Jsonb>,
        active -> Bool,
        created_at -> Timestamptz,
        #[max_length = 255]
        created_by -> Nullable<Varchar>,
    }
}

diesel::table! {
    stays (id) {
        id -> Int8,
        person_id -> Int4,
        policy_id -> Int4,
        backend_id -> Int4,
        #[max_length = 10]
        protocol -> Varchar,
        source_ip -> Inet,
        proxy_ip -> Inet,
        #[max_length = 255]
        ssh_login -> Nullable<Varchar>,
        agent_used -> Bool,
        started_at -> Timestamptz,
        ends_at -> Nullable<Timestamptz>,
        #[max_length = 32]
        termination_reason -> Nullable<Varchar>,
        #[max_length = 512]
        recording_path -> Nullable<Varchar>,
        recording_bytes -> Int8,
        bytes_in -> Int8,
        bytes_out -> Int8,
    }
}

diesel::table! {
    stay_sessions (id) {
        id -> Int8,
        stay_id -> Int8,
        #[max_length = 20]
        kind -> Varchar,
        started_at -> Timestamptz,
        ended_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    audit_events (id) {
        id -> Int8,
        at -> Timestamptz,
        #[max_length = 255]
        actor -> Nullable<Varchar>,
        #[max_length = 64]
        kind -> Varchar,
        source_ip -> Nullable<Inet>,
        backend_id -> Nullable<Int4>,
        #[max_length = 10]
        protocol -> Nullable<Varchar>,
        admitted -> Bool,
        #[max_length = 64]
        reason -> Varchar,
        detail -> Nullable<Text>,
    }
}

diesel::table! {
    transcode_jobs (id) {
        id -> Int4,
        stay_id -> Int8,
        #[max_length = 16]
        status -> Varchar,
        priority -> Int4,
        progress -> Int4,
        total -> Int4,
        eta_seconds -> Nullable<Int4>,
        #[max_length = 512]
        output_path -> Nullable<Varchar>,
        error -> Nullable<Text>,
        created_at -> Timestamptz,
        started_at -> Nullable<Timestamptz>,
        finished_at -> Nullable<Timestamptz>,
    }
}

diesel::joinable!(source_ips -> persons (person_id));
diesel::joinable!(allocations -> backends (backend_id));
diesel::joinable!(server_group_members -> server_groups (group_id));
diesel::joinable!(server_group_members -> backends (backend_id));
diesel::joinable!(user_group_members -> user_groups (group_id));
diesel::joinable!(user_group_members -> persons (person_id));
diesel::joinable!(stays -> persons (person_id));
diesel::joinable!(stays -> policies (policy_id));
diesel::joinable!(stays -> backends (backend_id));
diesel::joinable!(stay_sessions -> stays (stay_id));
diesel::joinable!(transcode_jobs -> stays (stay_id));

diesel::allow_tables_to_appear_in_same_query!(
    persons,
    source_ips,
    backends,
    allocations,
    server_groups,
    server_group_members,
    user_groups,
    user_group_members,
    policies,
    stays,
    stay_sessions,
    audit_events,
    transcode_jobs,
);
