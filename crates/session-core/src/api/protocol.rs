//! Signaling method and parameter names
//!
//! Names of the outbound notifications built by the session events handler
//! and of the request parameters the core decodes.

// Client requests
pub const JOINROOM_METHOD: &str = "joinRoom";
pub const LEAVEROOM_METHOD: &str = "leaveRoom";
pub const PUBLISHVIDEO_METHOD: &str = "publishVideo";
pub const UNPUBLISHVIDEO_METHOD: &str = "unpublishVideo";
pub const RECEIVEVIDEO_METHOD: &str = "receiveVideoFrom";
pub const UNSUBSCRIBEFROMVIDEO_METHOD: &str = "unsubscribeFromVideo";
pub const ONICECANDIDATE_METHOD: &str = "onIceCandidate";
pub const SENDMESSAGE_ROOM_METHOD: &str = "sendMessage";
pub const STREAMPROPERTYCHANGED_METHOD: &str = "streamPropertyChanged";
pub const FORCEDISCONNECT_METHOD: &str = "forceDisconnect";
pub const FORCEUNPUBLISH_METHOD: &str = "forceUnpublish";
pub const APPLYFILTER_METHOD: &str = "applyFilter";
pub const EXECFILTERMETHOD_METHOD: &str = "execFilterMethod";
pub const REMOVEFILTER_METHOD: &str = "removeFilter";

// Server notifications
pub const PARTICIPANTJOINED_METHOD: &str = "participantJoined";
pub const PARTICIPANTLEFT_METHOD: &str = "participantLeft";
pub const PARTICIPANTEVICTED_METHOD: &str = "participantEvicted";
pub const PARTICIPANTPUBLISHED_METHOD: &str = "participantPublished";
pub const PARTICIPANTUNPUBLISHED_METHOD: &str = "participantUnpublished";
pub const PARTICIPANTSENDMESSAGE_METHOD: &str = "sendMessage";
pub const ROOMCLOSED_METHOD: &str = "roomClosed";
pub const MEDIAERROR_METHOD: &str = "mediaError";
pub const ICECANDIDATE_METHOD: &str = "iceCandidate";

// Notification params
pub const PARTICIPANTJOINED_USER_PARAM: &str = "id";
pub const PARTICIPANTJOINED_CREATEDAT_PARAM: &str = "createdAt";
pub const PARTICIPANTJOINED_METADATA_PARAM: &str = "metadata";
pub const PARTICIPANTLEFT_NAME_PARAM: &str = "connectionId";
pub const PARTICIPANTLEFT_REASON_PARAM: &str = "reason";
pub const PARTICIPANTEVICTED_CONNECTIONID_PARAM: &str = "connectionId";
pub const PARTICIPANTEVICTED_REASON_PARAM: &str = "reason";
pub const PARTICIPANTPUBLISHED_USER_PARAM: &str = "id";
pub const PARTICIPANTPUBLISHED_STREAMS_PARAM: &str = "streams";
pub const PARTICIPANTUNPUBLISHED_NAME_PARAM: &str = "connectionId";
pub const PARTICIPANTUNPUBLISHED_REASON_PARAM: &str = "reason";
pub const PARTICIPANTSENDMESSAGE_DATA_PARAM: &str = "data";
pub const PARTICIPANTSENDMESSAGE_FROM_PARAM: &str = "from";
pub const PARTICIPANTSENDMESSAGE_TYPE_PARAM: &str = "type";
pub const ROOMCLOSED_ROOM_PARAM: &str = "sessionId";
pub const MEDIAERROR_ERROR_PARAM: &str = "error";
pub const ICECANDIDATE_SENDERCONNECTIONID_PARAM: &str = "senderConnectionId";
pub const ICECANDIDATE_EPNAME_PARAM: &str = "endpointName";
pub const ICECANDIDATE_CANDIDATE_PARAM: &str = "candidate";
pub const ICECANDIDATE_SDPMID_PARAM: &str = "sdpMid";
pub const ICECANDIDATE_SDPMLINEINDEX_PARAM: &str = "sdpMLineIndex";
pub const STREAMPROPERTYCHANGED_CONNECTIONID_PARAM: &str = "connectionId";
pub const STREAMPROPERTYCHANGED_STREAMID_PARAM: &str = "streamId";
pub const STREAMPROPERTYCHANGED_PROPERTY_PARAM: &str = "property";
pub const STREAMPROPERTYCHANGED_NEWVALUE_PARAM: &str = "newValue";
pub const STREAMPROPERTYCHANGED_REASON_PARAM: &str = "reason";
